use crate::config::{GifEncode, MediaConfig, NsfwConfig, VideoEncode};
use crate::publisher::PublishClient;
use crate::text::strip_media_short_link;
use crate::transcoder::{TranscodeOp, Transcoder};
use crate::types::{ErrorKind, MediaItem, MirrorError, Result, SourceItem};
use regex::Regex;
use reqwest::Client;
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static PHOTO_EXTENSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(jpg|jpeg|png|webp)(\?.*)?$").expect("valid regex"));
static AVATAR_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_normal(\.(jpg|jpeg|png|gif|webp))$").expect("valid regex"));

/// Attachments uploaded for one item and the text with media artifacts removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaOutcome {
    pub attachment_ids: Vec<String>,
    pub text: String,
}

/// Bytes ready for upload
#[derive(Debug)]
pub struct PreparedMedia {
    pub data: Vec<u8>,
    pub file_name: String,
    pub sensitive: bool,
}

/// Downloads, transcodes and uploads an item's media
pub struct MediaPipeline {
    http: Client,
    transcoder: Transcoder,
    media: MediaConfig,
    nsfw: NsfwConfig,
}

impl MediaPipeline {
    pub fn new(media: MediaConfig, nsfw: NsfwConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(media.download_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let transcoder = Transcoder::new(&media.ffmpeg_path, Duration::from_secs(media.stall_timeout_secs));

        Ok(Self {
            http,
            transcoder,
            media,
            nsfw,
        })
    }

    /// Upload every media item of `source`, in order. A failed item is
    /// logged and left out; the rest still upload. Shutdown aborts the whole
    /// set with [`MirrorError::Cancelled`] so the item is not published
    /// without its media.
    ///
    /// `text` is the rendered body to clean up; sensitivity keywords are
    /// matched against the source's raw text.
    pub async fn process(
        &self,
        source: &SourceItem,
        text: &str,
        publisher: &PublishClient,
        cancel: &CancellationToken,
    ) -> Result<MediaOutcome> {
        let items = &source.media;
        if items.is_empty() {
            return Ok(MediaOutcome {
                attachment_ids: Vec::new(),
                text: text.to_string(),
            });
        }

        info!("Processing {} media items for {}", items.len(), source.id);
        let mut attachment_ids = Vec::with_capacity(items.len());

        for (idx, item) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Shutdown requested during media of {}", source.id);
                return Err(MirrorError::Cancelled);
            }
            debug!("[{}/{}] {} for {}", idx + 1, items.len(), item.kind(), source.id);

            let uploaded = match self.prepare(idx, item, &source.text, &source.id).await {
                Ok(prepared) => {
                    publisher
                        .upload_file(prepared.data, &prepared.file_name, prepared.sensitive)
                        .await
                }
                Err(e) => Err(e),
            };

            match uploaded {
                Ok(file_id) => attachment_ids.push(file_id),
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    warn!("Media upload for {} interrupted by shutdown", source.id);
                    return Err(e);
                }
                Err(e) => error!("Media {} of {} dropped: {}", idx, source.id, e),
            }
        }

        Ok(MediaOutcome {
            attachment_ids,
            text: strip_media_short_link(text),
        })
    }

    /// Fetch and convert one media item into upload-ready bytes. `raw_text`
    /// is the source text the sensitivity keywords are checked against.
    pub async fn prepare(
        &self,
        idx: usize,
        item: &MediaItem,
        raw_text: &str,
        source_id: &str,
    ) -> Result<PreparedMedia> {
        let sensitive = resolve_nsfw(raw_text, item, &self.nsfw);

        match item {
            MediaItem::Photo { url } => {
                let url = upgrade_photo_url(url);
                let (data, ext) = self.still_image(&url).await?;
                Ok(PreparedMedia {
                    data,
                    file_name: format!("{}_{}.{}", source_id, idx, ext),
                    sensitive,
                })
            }
            MediaItem::Video { .. } => {
                let input_url = best_variant_url(item)?;
                let op = match self.media.video_encode {
                    VideoEncode::Copy => TranscodeOp::Repackage { input_url },
                    VideoEncode::X265 => TranscodeOp::Reencode {
                        input_url,
                        crf: self.media.crf,
                    },
                };
                let data = self.transcoder.run(&op, None).await?;
                Ok(PreparedMedia {
                    data,
                    file_name: format!("{}_{}.mp4", source_id, idx),
                    sensitive,
                })
            }
            MediaItem::AnimatedGif { .. } => {
                let input_url = best_variant_url(item)?;
                let (op, ext) = match self.media.gif_encode {
                    GifEncode::Gif => (
                        TranscodeOp::PaletteAnimation {
                            input_url,
                            fps_max: self.media.gif_fps_max,
                        },
                        "gif",
                    ),
                    GifEncode::X265 => (
                        TranscodeOp::AnimationToVideo {
                            input_url,
                            crf: self.media.crf,
                        },
                        "mp4",
                    ),
                    GifEncode::Copy => (TranscodeOp::Repackage { input_url }, "mp4"),
                };
                let data = self.transcoder.run(&op, None).await?;
                Ok(PreparedMedia {
                    data,
                    file_name: format!("{}_{}.{}", source_id, idx, ext),
                    sensitive,
                })
            }
        }
    }

    /// Download an image and convert it to the still-image format. The
    /// original bytes are kept when conversion is off or fails.
    pub async fn still_image(&self, url: &str) -> Result<(Vec<u8>, &'static str)> {
        let original = self.download(url).await?;
        if !self.media.photo_avif {
            return Ok((original, "jpg"));
        }

        let op = TranscodeOp::StillImage {
            quality: self.media.photo_quality,
        };
        match self.transcoder.run(&op, Some(original.clone())).await {
            Ok(converted) => Ok((converted, "avif")),
            Err(e) => {
                warn!("Still-image conversion failed for {}, uploading original: {}", url, e);
                Ok((original, "jpg"))
            }
        }
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Downloading {}", url);
        let response = self.http.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

fn best_variant_url(item: &MediaItem) -> Result<String> {
    item.best_variant()
        .map(|variant| variant.url.clone())
        .ok_or_else(|| MirrorError::Decode(format!("{} has no downloadable variant", item.kind())))
}

/// Forced keyword, then safe keyword, then the per-type default
pub fn resolve_nsfw(text: &str, item: &MediaItem, config: &NsfwConfig) -> bool {
    if config.forced_words.iter().any(|w| !w.is_empty() && text.contains(w.as_str())) {
        return true;
    }
    if config.safe_words.iter().any(|w| !w.is_empty() && text.contains(w.as_str())) {
        return false;
    }
    match item {
        MediaItem::Photo { .. } => config.image_default,
        MediaItem::Video { .. } | MediaItem::AnimatedGif { .. } => config.video_default,
    }
}

/// Largest rendition of a `pbs.twimg.com/media` photo
pub fn upgrade_photo_url(url: &str) -> String {
    if !url.contains("pbs.twimg.com/media/") {
        return url.to_string();
    }
    let base = PHOTO_EXTENSION_RE.replace(url, "");
    format!("{}?format=jpg&name=large", base)
}

/// 400x400 rendition of a `_normal` profile image
pub fn upgrade_avatar_url(url: &str) -> String {
    AVATAR_SIZE_RE.replace(url, "_400x400$1").into_owned()
}
