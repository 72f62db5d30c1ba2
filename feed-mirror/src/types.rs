use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Author of a source item, as decoded from the feed boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAuthor {
    pub id: String,
    pub handle: String,
}

/// Source-side account profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUser {
    pub id: String,
    pub handle: String,
    pub profile_image_url: Option<String>,
    pub profile_banner_url: Option<String>,
    pub pinned_item_ids: Vec<String>,
}

/// Short link in an item's text together with its expanded target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlEntity {
    pub short_url: String,
    pub expanded_url: String,
}

/// One encoded rendition of a video or animated GIF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub url: String,
    pub bitrate: Option<u64>,
    pub content_type: String,
}

impl Variant {
    /// Streaming manifests (HLS playlists) are never downloadable renditions.
    pub fn is_manifest(&self) -> bool {
        let content_type = self.content_type.to_ascii_lowercase();
        content_type.contains("mpegurl") || self.url.contains(".m3u8")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaItem {
    Photo { url: String },
    Video { variants: Vec<Variant> },
    AnimatedGif { variants: Vec<Variant> },
}

impl MediaItem {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaItem::Photo { .. } => "photo",
            MediaItem::Video { .. } => "video",
            MediaItem::AnimatedGif { .. } => "animated_gif",
        }
    }

    /// Highest-bitrate downloadable variant. Variants without a bitrate and
    /// manifest variants are not eligible; photos have no variants.
    pub fn best_variant(&self) -> Option<&Variant> {
        let variants = match self {
            MediaItem::Photo { .. } => return None,
            MediaItem::Video { variants } | MediaItem::AnimatedGif { variants } => variants,
        };

        variants
            .iter()
            .filter(|v| v.bitrate.is_some() && !v.is_manifest() && !v.url.is_empty())
            .max_by_key(|v| v.bitrate.unwrap_or_default())
    }
}

/// A post fetched from the source feed. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub author: SourceAuthor,
    pub media: Vec<MediaItem>,
    pub url_entities: Vec<UrlEntity>,
    pub reply_to_id: Option<String>,
    pub quoted_item: Option<Box<SourceItem>>,
    /// Id of a quoted item whose payload could not be decoded
    #[serde(default)]
    pub unavailable_quote_id: Option<String>,
    pub retweeted_item: Option<Box<SourceItem>>,
}

/// Whether a mirrored post was authored by the account itself or is the
/// text mirror of somebody else's item that the account retweeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    SelfAuthored,
    MirroredRetweet,
}

impl Ownership {
    pub fn as_flag(self) -> i64 {
        match self {
            Ownership::SelfAuthored => 1,
            Ownership::MirroredRetweet => 0,
        }
    }

    pub fn from_flag(flag: i64) -> Self {
        if flag == 0 {
            Ownership::MirroredRetweet
        } else {
            Ownership::SelfAuthored
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub source_item_id: String,
    pub target_post_id: String,
    pub ownership: Ownership,
    pub account_label: String,
}

/// Per-account cursor persisted between cycles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkState {
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned_item_id: Option<String>,
    #[serde(default)]
    pub pinned_post_id: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub profile_banner_url: Option<String>,
}

impl WatermarkState {
    /// Move the watermark forward. Older timestamps are ignored; returns
    /// whether the watermark changed.
    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        match self.last_processed_at {
            Some(current) if current >= to => false,
            _ => {
                self.last_processed_at = Some(to);
                true
            }
        }
    }

    /// Explicit reset, the only way the watermark may move backwards.
    pub fn reset(&mut self, to: Option<DateTime<Utc>>) {
        self.last_processed_at = to;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Home,
    Followers,
    Specified,
}

/// Note-create call, assembled just before send
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "fileIds", skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
    #[serde(rename = "replyId", skip_serializing_if = "Option::is_none")]
    pub reply_target: Option<String>,
    #[serde(rename = "renoteId", skip_serializing_if = "Option::is_none")]
    pub renote_target: Option<String>,
    pub visibility: Visibility,
    pub local_only: bool,
}

/// Result of the publish step for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { post_id: String },
    Skipped { reason: String },
}

/// What happened to one source item during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Published { post_id: String },
    Renoted { post_id: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub bootstrapped: bool,
    pub scanned: usize,
    pub published: usize,
    pub renoted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Classification of an error, produced once where the error is created and
/// consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    AccountUnavailable,
    Client,
    Cancelled,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Account @{handle} unavailable: {reason}")]
    AccountUnavailable { handle: String, reason: String },

    #[error("API error [{status}] on {endpoint}: {body}")]
    Api { endpoint: String, status: u16, body: String },

    #[error("Transcode [{label}] failed: {detail}")]
    Transcode { label: String, detail: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("General error: {0}")]
    General(String),
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::Http(e) => {
                if e.is_decode() {
                    ErrorKind::Other
                } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    ErrorKind::Transient
                } else if let Some(status) = e.status() {
                    classify_status(status.as_u16())
                } else {
                    ErrorKind::Transient
                }
            }
            MirrorError::RateLimited { .. } => ErrorKind::RateLimited,
            MirrorError::AccountUnavailable { .. } => ErrorKind::AccountUnavailable,
            MirrorError::Api { status, .. } => classify_status(*status),
            MirrorError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

/// Status-code classification shared by every HTTP surface.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        500 | 502 | 503 | 504 => ErrorKind::Transient,
        400..=499 => ErrorKind::Client,
        _ => ErrorKind::Other,
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
