use crate::config::NoteConfig;
use crate::traits::LinkSanitizer;
use crate::types::{SourceItem, UrlEntity};
use regex::{Captures, Regex};
use std::sync::{Arc, LazyLock};
use tracing::debug;
use url::Url;

const SITE: &str = "https://x.com";

/// Private-use code points bracketing a protected segment index
const SHIELD_OPEN: char = '\u{E000}';
const SHIELD_CLOSE: char = '\u{E001}';

static MEDIA_SHORT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*https://t\.co/\S+$").expect("valid regex"));
/// Segments a mention pass must never touch: links it produced earlier,
/// `<plain>` spans and bare URLs
static PROTECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\?\[[^\]\n]*\]\([^)\s]*\)|<plain>.*?</plain>|https?://\S+").expect("valid regex")
});
static FEDERATED_MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@([A-Za-z0-9_]+)@([A-Za-z0-9._-]+\.[A-Za-z]{2,})").expect("valid regex")
});
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_]{1,50})").expect("valid regex"));
static SHIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{E000}(\\d+)\u{E001}").expect("valid regex"));

/// Deterministic rewrite of source text into target markup.
///
/// `render` runs the body pipeline: entity decode, hashtag normalization,
/// trailing media link strip, short-link expansion and mention linking.
/// The back-link is appended separately by [`TextTransformer::with_backlink`]
/// once the caller has finished adding reply and quote context.
#[derive(Clone)]
pub struct TextTransformer {
    mention_links: bool,
    suppress_backlink_preview: bool,
    sanitizer: Option<Arc<dyn LinkSanitizer>>,
}

impl TextTransformer {
    pub fn new(config: &NoteConfig) -> Self {
        let sanitizer: Option<Arc<dyn LinkSanitizer>> = if config.url_cleaner {
            Some(Arc::new(TrackingParamCleaner::new(config.extra_tracking_params.clone())))
        } else {
            None
        };

        Self {
            mention_links: config.mention_links,
            suppress_backlink_preview: config.suppress_backlink_preview,
            sanitizer,
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn LinkSanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn render(&self, text: &str, url_entities: &[UrlEntity]) -> String {
        let text = decode_entities(text);
        let text = normalize_hashtags(&text);
        let text = strip_media_short_link(&text);
        let text = expand_links(&text, url_entities, self.sanitizer.as_deref());
        if self.mention_links {
            link_mentions(&text)
        } else {
            text
        }
    }

    pub fn with_backlink(&self, text: &str, url: &str) -> String {
        append_backlink(text, url, self.suppress_backlink_preview)
    }

    /// Body plus back-link for an item posted by the account itself
    pub fn transform(&self, item: &SourceItem) -> String {
        let body = self.render(&item.text, &item.url_entities);
        self.with_backlink(&body, &item_url(&item.author.handle, &item.id))
    }

    /// Attributed text mirror of somebody else's item
    pub fn compose_retweet(&self, retweeted: &SourceItem) -> String {
        let body = self.render(&retweeted.text, &retweeted.url_entities);
        format!("RT {}: {}", profile_link(&retweeted.author.handle), body)
    }

    /// Attributed text of a quoted item, embedded below the outer text
    pub fn compose_quote(&self, quoted: &SourceItem) -> String {
        let body = self.render(&quoted.text, &quoted.url_entities);
        format!("QT {}: {}", profile_link(&quoted.author.handle), body)
    }
}

pub fn item_url(handle: &str, item_id: &str) -> String {
    format!("{}/{}/status/{}", SITE, handle, item_id)
}

fn profile_link(handle: &str) -> String {
    format!("?[@{}]({}/{})", handle, SITE, handle)
}

pub fn append_backlink(text: &str, url: &str, suppress_preview: bool) -> String {
    if suppress_preview {
        format!("{}\nX : ?[{}]({})", text, url, url)
    } else {
        format!("{}\nX : {}", text, url)
    }
}

/// Reference to a parent item that has no mirrored counterpart
pub fn prefix_reply_fallback(text: &str, reply_to_id: &str) -> String {
    format!("Reply to : {}/x/status/{}\n\n{}", SITE, reply_to_id, text)
}

/// Remove the quoted item's own status link from the outer text
pub fn remove_quote_link(text: &str, quoted_id: &str) -> String {
    let pattern = format!(
        r"\s*https://(?:twitter|x)\.com/\S+/status/{}\S*",
        regex::escape(quoted_id)
    );
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, "").trim_end().to_string(),
        Err(_) => text.to_string(),
    }
}

/// The short link a media attachment leaves at the end of the text
pub fn strip_media_short_link(text: &str) -> String {
    let trimmed = text.trim_end();
    MEDIA_SHORT_LINK_RE.replace(trimmed, "").trim_end().to_string()
}

pub fn expand_links(text: &str, url_entities: &[UrlEntity], sanitizer: Option<&dyn LinkSanitizer>) -> String {
    let mut text = text.to_string();
    for entity in url_entities {
        if entity.short_url.is_empty() || !text.contains(&entity.short_url) {
            continue;
        }
        let expanded = match sanitizer {
            Some(sanitizer) => sanitizer.sanitize(&entity.expanded_url),
            None => entity.expanded_url.clone(),
        };
        debug!("Expanding {} -> {}", entity.short_url, expanded);
        text = text.replace(&entity.short_url, &expanded);
    }
    text
}

/// Decode the character references the source escapes in post text.
/// Unknown references are left as written.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let decoded = decode_reference(&rest[1..end])?;
            Some((decoded, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix('x').or_else(|| digits.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// `＃` starting a tag becomes `#`, and fullwidth ASCII letters, digits and
/// underscores in a tag body become halfwidth. Other scripts are untouched.
pub fn normalize_hashtags(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;

    for (i, &c) in chars.iter().enumerate() {
        if c == '#' || c == '＃' {
            let prev_ok = i == 0 || !is_tag_char(chars[i - 1]);
            let next_ok = chars.get(i + 1).is_some_and(|&n| is_tag_char(n));
            if prev_ok && next_ok {
                in_tag = true;
                out.push('#');
                continue;
            }
            in_tag = false;
            out.push(c);
            continue;
        }

        if in_tag && is_tag_char(c) {
            out.push(to_halfwidth(c));
        } else {
            in_tag = false;
            out.push(c);
        }
    }
    out
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '＿'
}

fn to_halfwidth(c: char) -> char {
    match c {
        '０'..='９' | 'Ａ'..='Ｚ' | 'ａ'..='ｚ' | '＿' => {
            char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
        }
        _ => c,
    }
}

/// Turn `@handle` into a profile link. `@user@host` mentions are wrapped in
/// `<plain>` instead, and text already inside a link, a `<plain>` span or a
/// URL is left alone, so running this twice changes nothing.
pub fn link_mentions(text: &str) -> String {
    let mut shielded: Vec<String> = Vec::new();
    let mut shield = |segment: String| -> String {
        shielded.push(segment);
        format!("{}{}{}", SHIELD_OPEN, shielded.len() - 1, SHIELD_CLOSE)
    };

    let text = PROTECTED_RE
        .replace_all(text, |caps: &Captures<'_>| shield(caps[0].to_string()))
        .into_owned();

    let text = replace_guarded(&text, &FEDERATED_MENTION_RE, |prev, _next| {
        !prev.is_some_and(|p| p.is_ascii_alphanumeric() || matches!(p, '_' | '[' | '('))
    }, |caps| shield(format!("<plain>{}</plain>", &caps[0])));

    let text = replace_guarded(&text, &MENTION_RE, |prev, next| {
        let prev_ok = !prev.is_some_and(|p| p.is_ascii_alphanumeric() || matches!(p, '_' | '@' | '[' | '('));
        let next_ok = !next.is_some_and(|n| n.is_ascii_alphanumeric() || matches!(n, '_' | '@' | ']' | ')'));
        prev_ok && next_ok
    }, |caps| format!("?[@{}]({}/{})", &caps[1], SITE, &caps[1]));

    SHIELD_RE
        .replace_all(&text, |caps: &Captures<'_>| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|idx| shielded.get(idx).cloned())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// `replace_all` with a check on the characters around each match, standing
/// in for look-around assertions.
fn replace_guarded(
    text: &str,
    re: &Regex,
    accept: impl Fn(Option<char>, Option<char>) -> bool,
    mut replacement: impl FnMut(&Captures<'_>) -> String,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let prev = text[..whole.start()].chars().next_back();
        let next = text[whole.end()..].chars().next();
        if !accept(prev, next) {
            continue;
        }
        out.push_str(&text[last..whole.start()]);
        out.push_str(&replacement(&caps));
        last = whole.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Query parameters that only identify where a click came from
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "igshid", "mc_cid", "mc_eid", "msclkid", "yclid", "ref_src", "ref_url",
];
const SHARE_HOSTS: &[&str] = &["x.com", "twitter.com", "www.x.com", "www.twitter.com", "mobile.twitter.com"];

/// Removes tracking query parameters, keeping every other parameter in order
#[derive(Debug, Clone, Default)]
pub struct TrackingParamCleaner {
    extra: Vec<String>,
}

impl TrackingParamCleaner {
    pub fn new(extra: Vec<String>) -> Self {
        Self { extra }
    }

    fn is_tracking(&self, host: &str, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        key.starts_with("utm_")
            || TRACKING_PARAMS.contains(&key.as_str())
            || self.extra.iter().any(|e| e.eq_ignore_ascii_case(&key))
            || (SHARE_HOSTS.contains(&host) && matches!(key.as_str(), "s" | "t"))
    }
}

impl LinkSanitizer for TrackingParamCleaner {
    fn sanitize(&self, url: &str) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };
        if parsed.query().is_none() {
            return url.to_string();
        }

        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        let kept: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| !self.is_tracking(&host, k)).collect();
        if kept.len() == pairs.len() {
            return url.to_string();
        }

        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed
                .query_pairs_mut()
                .clear()
                .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        parsed.to_string()
    }
}
