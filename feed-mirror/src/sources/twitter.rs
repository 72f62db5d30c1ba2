use crate::config::SourceConfig;
use crate::traits::{SourceFeed, TimelinePage};
use crate::types::{
    MediaItem, MirrorError, Result, SourceAuthor, SourceItem, SourceUser, UrlEntity, Variant,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes the v1.1 API uses for locked and suspended accounts
const LOCKED_CODES: &[i64] = &[326];
const SUSPENDED_CODES: &[i64] = &[63, 64];

/// Source feed over the v1.1-style JSON REST surface.
///
/// Credentials are opaque: a bearer token and an optional session cookie
/// obtained by a separate login tool.
pub struct HttpSourceFeed {
    client: Client,
    config: SourceConfig,
}

impl HttpSourceFeed {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str, query: &[(&str, String)], subject: &str) -> Result<Response> {
        let mut request = self
            .client
            .get(self.endpoint(path))
            .query(query)
            .bearer_auth(&self.config.bearer_token);

        if let Some(cookie) = &self.config.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(classify_failure(path, subject, response).await)
    }
}

/// Turn a non-success response into the error kind callers act on.
async fn classify_failure(endpoint: &str, subject: &str, response: Response) -> MirrorError {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return MirrorError::RateLimited { retry_after };
    }

    let body = response.text().await.unwrap_or_default();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) {
        if let Ok(envelope) = serde_json::from_str::<RawErrorEnvelope>(&body) {
            for err in envelope.errors {
                if LOCKED_CODES.contains(&err.code) {
                    return MirrorError::AccountUnavailable {
                        handle: subject.to_string(),
                        reason: format!("locked: {}", err.message),
                    };
                }
                if SUSPENDED_CODES.contains(&err.code) {
                    return MirrorError::AccountUnavailable {
                        handle: subject.to_string(),
                        reason: format!("suspended: {}", err.message),
                    };
                }
            }
        }
    }

    MirrorError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    }
}

#[async_trait]
impl SourceFeed for HttpSourceFeed {
    fn source_name(&self) -> String {
        match url::Url::parse(&self.config.base_url) {
            Ok(parsed) => format!("source ({})", parsed.host_str().unwrap_or("unknown")),
            Err(_) => "source".to_string(),
        }
    }

    async fn user_by_handle(&self, handle: &str) -> Result<SourceUser> {
        let response = self
            .get("1.1/users/show.json", &[("screen_name", handle.to_string())], handle)
            .await?;
        let raw: RawUser = response.json().await?;
        Ok(raw.into_user())
    }

    async fn timeline_page(
        &self,
        user_id: &str,
        count: usize,
        cursor: Option<&str>,
    ) -> Result<TimelinePage> {
        let mut query = vec![
            ("user_id", user_id.to_string()),
            ("count", count.to_string()),
            ("tweet_mode", "extended".to_string()),
            ("include_rts", "true".to_string()),
            ("exclude_replies", "false".to_string()),
        ];
        if let Some(max_id) = cursor {
            query.push(("max_id", max_id.to_string()));
        }

        let response = self.get("1.1/statuses/user_timeline.json", &query, user_id).await?;
        let raw: Vec<Value> = response.json().await?;
        let items = decode_statuses(raw);
        let next_cursor = next_max_id(&items);
        debug!("Timeline page for {}: {} items, next={:?}", user_id, items.len(), next_cursor);

        Ok(TimelinePage { items, next_cursor })
    }

    async fn item_by_id(&self, item_id: &str) -> Result<SourceItem> {
        let query = [("id", item_id.to_string()), ("tweet_mode", "extended".to_string())];
        let response = self.get("1.1/statuses/show.json", &query, item_id).await?;
        let raw: RawStatus = response.json().await?;
        raw.into_item()
    }
}

/// Decode a page one status at a time, dropping (and logging) entries that
/// cannot be decoded
pub fn decode_statuses(raw: Vec<Value>) -> Vec<SourceItem> {
    raw.into_iter()
        .filter_map(|value| {
            let id = status_id(&value).unwrap_or_else(|| "?".to_string());
            match decode_status(value) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!("Dropping undecodable item {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

fn decode_status(value: Value) -> Result<SourceItem> {
    let raw: RawStatus = serde_json::from_value(value)?;
    raw.into_item()
}

fn status_id(value: &Value) -> Option<String> {
    value.get("id_str").and_then(Value::as_str).map(str::to_string)
}

/// Pages are requested with `max_id`, which is inclusive, so the cursor is
/// one below the oldest id seen.
fn next_max_id(items: &[SourceItem]) -> Option<String> {
    items
        .iter()
        .filter_map(|item| item.id.parse::<u64>().ok())
        .min()
        .and_then(|oldest| oldest.checked_sub(1))
        .map(|id| id.to_string())
}

pub fn parse_created_at(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%a %b %d %H:%M:%S %z %Y")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MirrorError::Decode(format!("bad created_at {:?}: {}", value, e)))
}

#[derive(Debug, Deserialize)]
struct RawErrorEnvelope {
    #[serde(default)]
    errors: Vec<RawApiError>,
}

#[derive(Debug, Deserialize)]
struct RawApiError {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUser {
    pub id_str: String,
    pub screen_name: String,
    #[serde(default)]
    pub profile_image_url_https: Option<String>,
    #[serde(default)]
    pub profile_banner_url: Option<String>,
    #[serde(default)]
    pub pinned_tweet_ids_str: Vec<String>,
}

impl RawUser {
    fn into_user(self) -> SourceUser {
        SourceUser {
            id: self.id_str,
            handle: self.screen_name,
            profile_image_url: self.profile_image_url_https.filter(|u| !u.is_empty()),
            profile_banner_url: self.profile_banner_url.filter(|u| !u.is_empty()),
            pinned_item_ids: self.pinned_tweet_ids_str,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStatus {
    pub id_str: String,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub created_at: String,
    pub user: RawUser,
    #[serde(default)]
    pub entities: RawEntities,
    #[serde(default)]
    pub extended_entities: Option<RawEntities>,
    #[serde(default)]
    pub in_reply_to_status_id_str: Option<String>,
    #[serde(default)]
    pub quoted_status_id_str: Option<String>,
    /// Nested statuses stay raw so a malformed one only loses itself
    #[serde(default)]
    pub quoted_status: Option<Value>,
    #[serde(default)]
    pub retweeted_status: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntities {
    #[serde(default)]
    pub urls: Vec<RawUrl>,
    #[serde(default)]
    pub media: Vec<RawMedia>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUrl {
    pub url: String,
    #[serde(default)]
    pub expanded_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMedia {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub media_url_https: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub video_info: Option<RawVideoInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoInfo {
    #[serde(default)]
    pub variants: Vec<RawVariant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVariant {
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub url: String,
}

impl RawMedia {
    fn into_media(self) -> Option<MediaItem> {
        let variants = || {
            self.video_info
                .clone()
                .unwrap_or_default()
                .variants
                .into_iter()
                .map(|v| Variant {
                    url: v.url,
                    bitrate: v.bitrate,
                    content_type: v.content_type.unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        };

        match self.kind.as_str() {
            "photo" => {
                let url = self.media_url_https.clone().or_else(|| self.media_url.clone())?;
                Some(MediaItem::Photo { url })
            }
            "video" => Some(MediaItem::Video { variants: variants() }),
            "animated_gif" => Some(MediaItem::AnimatedGif { variants: variants() }),
            other => {
                debug!("Ignoring unknown media type {}", other);
                None
            }
        }
    }
}

impl RawStatus {
    pub fn into_item(self) -> Result<SourceItem> {
        let created_at = parse_created_at(&self.created_at)?;
        let text = self.full_text.or(self.text).unwrap_or_default();

        // extended_entities carries every attachment; entities only the first
        let media_source = self.extended_entities.unwrap_or_else(|| self.entities.clone());
        let media = media_source
            .media
            .into_iter()
            .filter_map(RawMedia::into_media)
            .collect();

        let url_entities = self
            .entities
            .urls
            .into_iter()
            .filter_map(|u| {
                let expanded = u.expanded_url.filter(|e| !e.is_empty())?;
                Some(UrlEntity {
                    short_url: u.url,
                    expanded_url: expanded,
                })
            })
            .collect();

        let (quoted_item, unavailable_quote_id) = match self.quoted_status {
            Some(value) => {
                let quoted_id = status_id(&value).or_else(|| self.quoted_status_id_str.clone());
                match decode_status(value) {
                    Ok(quoted) => (Some(Box::new(quoted)), None),
                    Err(e) => {
                        warn!("Quoted item of {} is undecodable: {}", self.id_str, e);
                        (None, Some(quoted_id.unwrap_or_default()))
                    }
                }
            }
            // withheld quotes carry only the id
            None => (None, self.quoted_status_id_str.filter(|id| !id.is_empty())),
        };
        let retweeted_item = match self.retweeted_status {
            Some(value) => match decode_status(value) {
                Ok(retweeted) => Some(Box::new(retweeted)),
                Err(e) => {
                    warn!("Retweeted item of {} is undecodable, mirroring as a plain post: {}", self.id_str, e);
                    None
                }
            },
            None => None,
        };

        Ok(SourceItem {
            id: self.id_str,
            text,
            created_at,
            author: SourceAuthor {
                id: self.user.id_str,
                handle: self.user.screen_name,
            },
            media,
            url_entities,
            reply_to_id: self.in_reply_to_status_id_str.filter(|id| !id.is_empty()),
            quoted_item,
            unavailable_quote_id,
            retweeted_item,
        })
    }
}
