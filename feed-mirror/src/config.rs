use crate::retry::RetryPolicy;
use crate::types::{MirrorError, Result, Visibility};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from a TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub crawl: CrawlConfig,
    pub note: NoteConfig,
    pub media: MediaConfig,
    pub nsfw: NsfwConfig,
    pub profile: ProfileConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub source: SourceConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let text = String::from_utf8(raw)
            .map_err(|e| MirrorError::Config(format!("{} is not UTF-8: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| MirrorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(MirrorError::Config("no [[accounts]] configured".to_string()));
        }
        for account in &self.accounts {
            if account.handle.trim().is_empty() {
                return Err(MirrorError::Config("account with empty handle".to_string()));
            }
            if account.target_host.trim().is_empty() || account.target_token.trim().is_empty() {
                return Err(MirrorError::Config(format!(
                    "account @{} is missing target_host or target_token",
                    account.handle
                )));
            }
        }
        if self.source.bearer_token.trim().is_empty() {
            return Err(MirrorError::Config("source.bearer_token is empty".to_string()));
        }
        if self.crawl.page_size == 0 {
            return Err(MirrorError::Config("crawl.page_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub interval_secs: u64,
    pub page_size: usize,
    pub page_pause_ms: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            page_size: 20,
            page_pause_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoteConfig {
    /// Fixed delay between successive publishes
    pub interval_secs: u64,
    pub retweet: bool,
    pub visibility: Visibility,
    pub local_only: bool,
    pub mention_links: bool,
    pub suppress_backlink_preview: bool,
    pub url_cleaner: bool,
    pub extra_tracking_params: Vec<String>,
    /// Publish attempts before an item is skipped
    pub skip_after_failures: u32,
    pub skip_backoff_secs: u64,
}

impl Default for NoteConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            retweet: true,
            visibility: Visibility::Public,
            local_only: false,
            mention_links: true,
            suppress_backlink_preview: true,
            url_cleaner: false,
            extra_tracking_params: Vec::new(),
            skip_after_failures: 3,
            skip_backoff_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoEncode {
    #[default]
    Copy,
    X265,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GifEncode {
    #[default]
    Gif,
    X265,
    Copy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub video_encode: VideoEncode,
    pub gif_encode: GifEncode,
    pub gif_fps_max: u32,
    pub photo_avif: bool,
    pub photo_quality: u32,
    pub crf: u32,
    pub ffmpeg_path: PathBuf,
    pub stall_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_encode: VideoEncode::Copy,
            gif_encode: GifEncode::Gif,
            gif_fps_max: 15,
            photo_avif: true,
            photo_quality: 50,
            crf: 28,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            stall_timeout_secs: 300,
            download_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NsfwConfig {
    pub forced_words: Vec<String>,
    pub safe_words: Vec<String>,
    pub image_default: bool,
    pub video_default: bool,
}

impl Default for NsfwConfig {
    fn default() -> Self {
        Self {
            forced_words: Vec::new(),
            safe_words: Vec::new(),
            image_default: false,
            video_default: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub avatar: bool,
    pub banner: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            avatar: true,
            banner: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn dedup_database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.data_dir.join("id_data.db").display())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Serializable shape of a [`RetryPolicy`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub rate_limit_step_ms: u64,
    pub rate_limit_max_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            rate_limit_step: Duration::from_millis(self.rate_limit_step_ms),
            rate_limit_max: Duration::from_millis(self.rate_limit_max_ms),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::target()
    }
}

impl RetrySettings {
    pub fn source() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 5_000,
            multiplier: 5.0,
            max_delay_ms: 120_000,
            rate_limit_step_ms: 60_000,
            rate_limit_max_ms: 300_000,
        }
    }

    pub fn target() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            rate_limit_step_ms: 15_000,
            rate_limit_max_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub source: RetrySettings,
    pub target: RetrySettings,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            source: RetrySettings::source(),
            target: RetrySettings::target(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub cookie: Option<String>,
    pub user_agent: String,
    pub timeout_seconds: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitter.com".to_string(),
            bearer_token: String::new(),
            cookie: None,
            user_agent: "feed-mirror/0.1".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// One source account mirrored to one target account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub handle: String,
    pub target_host: String,
    pub target_token: String,
}
