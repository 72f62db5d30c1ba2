use crate::config::{AccountConfig, Config, NoteConfig, ProfileConfig};
use crate::dedup::DedupIndex;
use crate::media::{upgrade_avatar_url, MediaPipeline};
use crate::publisher::{PublishClient, SkipPolicy};
use crate::scanner::{sort_chronological, FeedScanner, PinnedChange};
use crate::shutdown::sleep_or_cancel;
use crate::text::{item_url, prefix_reply_fallback, remove_quote_link, TextTransformer};
use crate::traits::SourceFeed;
use crate::types::{
    CycleReport, ErrorKind, ItemOutcome, MirrorError, Ownership, PublishOutcome, PublishRequest, Result, SourceItem,
    SourceUser, WatermarkState,
};
use crate::watermark::WatermarkStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const QUOTE_UNAVAILABLE: &str = "QT: (quoted item unavailable)";

#[derive(Debug, Clone, Copy)]
enum ProfileAsset {
    Avatar,
    Banner,
}

impl ProfileAsset {
    fn label(self) -> &'static str {
        match self {
            ProfileAsset::Avatar => "avatar",
            ProfileAsset::Banner => "banner",
        }
    }
}

/// Shared collaborators one orchestrator per account is built from
#[derive(Clone)]
pub struct SyncResources {
    pub source: Arc<dyn SourceFeed>,
    pub dedup: Arc<DedupIndex>,
    pub watermarks: Arc<WatermarkStore>,
    pub media: Arc<MediaPipeline>,
}

/// Drives one account's sync cycle: profile, scan, pinned reconciliation,
/// per-item mirroring and the final pin update.
pub struct SyncOrchestrator {
    handle: String,
    scanner: FeedScanner,
    dedup: Arc<DedupIndex>,
    watermarks: Arc<WatermarkStore>,
    media: Arc<MediaPipeline>,
    text: TextTransformer,
    publisher: PublishClient,
    note: NoteConfig,
    profile: ProfileConfig,
    skip: SkipPolicy,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        account: &AccountConfig,
        config: &Config,
        resources: &SyncResources,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let scanner = FeedScanner::new(
            resources.source.clone(),
            config.retry.source.policy(),
            config.crawl.page_size,
            Duration::from_millis(config.crawl.page_pause_ms),
        );
        let publisher = PublishClient::new(
            &account.target_host,
            &account.target_token,
            config.retry.target.policy(),
            cancel.clone(),
        )?;

        Ok(Self {
            handle: account.handle.clone(),
            scanner,
            dedup: resources.dedup.clone(),
            watermarks: resources.watermarks.clone(),
            media: resources.media.clone(),
            text: TextTransformer::new(&config.note),
            publisher,
            note: config.note.clone(),
            profile: config.profile.clone(),
            skip: SkipPolicy::from_config(&config.note),
            cancel,
        })
    }

    pub fn with_text_transformer(mut self, text: TextTransformer) -> Self {
        self.text = text;
        self
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn publisher(&self) -> &PublishClient {
        &self.publisher
    }

    /// Run one cycle inside a span carrying the account and a fresh run id
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let span = info_span!("cycle", account = %self.handle, run_id = %Uuid::new_v4());
        self.cycle().instrument(span).await
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut state = self.watermarks.load(&self.handle).await?;

        let user = self.scanner.user(&self.handle, &self.cancel).await?;
        info!("Cycle start for @{} (id {})", user.handle, user.id);

        let Some(watermark) = state.last_processed_at else {
            let start = self.scanner.bootstrap(&user, &self.cancel).await?;
            state.reset(Some(start));
            self.watermarks.save(&self.handle, &state).await?;
            info!("First run for @{}: watermark set to {}, nothing backfilled", self.handle, start.to_rfc3339());
            report.bootstrapped = true;
            return Ok(report);
        };

        self.sync_profile(&user, &mut state).await;
        self.watermarks.save(&self.handle, &state).await?;

        let scan = self.scanner.fetch(&user, watermark, &self.cancel).await?;
        if scan.partial {
            warn!("Timeline scan for @{} was partial; continuing with collected items", self.handle);
        }
        let mut items = scan.items;

        let pinned = self
            .scanner
            .reconcile_pinned(&user, state.pinned_item_id.as_deref(), watermark, &mut items, &self.cancel)
            .await?;

        sort_chronological(&mut items);
        report.scanned = items.len();
        if items.is_empty() {
            info!("No new items for @{}", self.handle);
        }

        let mut interrupted = false;
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 && !sleep_or_cancel(&self.cancel, Duration::from_secs(self.note.interval_secs)).await {
                interrupted = true;
                break;
            }
            if self.cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            info!("[{}/{}] Processing {} ({})", idx + 1, items.len(), item.id, item.created_at.to_rfc3339());
            match self.process_item(item).await {
                Ok(outcome) => {
                    match &outcome {
                        ItemOutcome::Published { post_id } => {
                            info!("Mirrored {} as {}", item.id, post_id);
                            report.published += 1;
                        }
                        ItemOutcome::Renoted { post_id } => {
                            info!("Renoted {} as {}", item.id, post_id);
                            report.renoted += 1;
                        }
                        ItemOutcome::Skipped { reason } => {
                            warn!("Dropped {}: {}", item.id, reason);
                            report.skipped += 1;
                        }
                    }
                    state.advance(item.created_at);
                    self.watermarks.save(&self.handle, &state).await?;
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => {
                    info!("Shutdown during {}, leaving it for the next run", item.id);
                    interrupted = true;
                    break;
                }
                Err(e) => {
                    error!("Unexpected error on {}: {}", item.id, e);
                    report.failed += 1;
                }
            }
        }

        if interrupted {
            info!("Cycle for @{} interrupted by shutdown", self.handle);
        } else {
            self.commit_pinned(pinned, &mut state).await?;
        }

        self.watermarks.save(&self.handle, &state).await?;
        info!(
            "Cycle done for @{}: {} scanned, {} published, {} renoted, {} skipped, {} failed",
            self.handle, report.scanned, report.published, report.renoted, report.skipped, report.failed
        );
        Ok(report)
    }

    /// Mirror one item. Returns an error only for failures outside the
    /// publish step (dedup lookups, cancellation).
    pub async fn process_item(&self, item: &SourceItem) -> Result<ItemOutcome> {
        if self.note.retweet {
            if let Some(retweeted) = item.retweeted_item.as_deref() {
                return self.process_retweet(item, retweeted).await;
            }
        }
        self.process_post(item).await
    }

    async fn process_retweet(&self, item: &SourceItem, retweeted: &SourceItem) -> Result<ItemOutcome> {
        if let Some(existing) = self.dedup.get(&retweeted.id).await? {
            debug!("Retweet {} of mirrored {} -> renote {}", item.id, retweeted.id, existing);
            let request = PublishRequest {
                renote_target: Some(existing),
                ..self.base_request()
            };
            return match self.publisher.publish_or_skip(&request, &item.id, &self.skip).await? {
                PublishOutcome::Published { post_id } => {
                    self.dedup.put(&item.id, &post_id, Ownership::SelfAuthored, &self.handle).await?;
                    Ok(ItemOutcome::Renoted { post_id })
                }
                PublishOutcome::Skipped { reason } => Ok(ItemOutcome::Skipped { reason }),
            };
        }

        debug!("Retweet {} of unmirrored {} -> text mirror", item.id, retweeted.id);
        let body = self.text.compose_retweet(retweeted);
        let media = self
            .media
            .process(retweeted, &body, &self.publisher, &self.cancel)
            .await?;
        let text = self
            .text
            .with_backlink(&media.text, &item_url(&retweeted.author.handle, &retweeted.id));

        let request = PublishRequest {
            text: Some(text),
            attachment_ids: media.attachment_ids,
            ..self.base_request()
        };
        match self.publisher.publish_or_skip(&request, &item.id, &self.skip).await? {
            PublishOutcome::Published { post_id } => {
                self.dedup.put(&item.id, &post_id, Ownership::SelfAuthored, &self.handle).await?;
                if retweeted.id != item.id {
                    self.dedup
                        .put(&retweeted.id, &post_id, Ownership::MirroredRetweet, &self.handle)
                        .await?;
                }
                Ok(ItemOutcome::Published { post_id })
            }
            PublishOutcome::Skipped { reason } => Ok(ItemOutcome::Skipped { reason }),
        }
    }

    async fn process_post(&self, item: &SourceItem) -> Result<ItemOutcome> {
        let body = self.text.render(&item.text, &item.url_entities);
        let media = self
            .media
            .process(item, &body, &self.publisher, &self.cancel)
            .await?;
        let mut text = media.text;
        let mut attachment_ids = media.attachment_ids;

        let mut reply_target = None;
        if let Some(parent) = item.reply_to_id.as_deref() {
            match self.dedup.get(parent).await? {
                Some(post_id) => {
                    debug!("{} replies to mirrored {} ({})", item.id, parent, post_id);
                    reply_target = Some(post_id);
                }
                None => text = prefix_reply_fallback(&text, parent),
            }
        }

        let mut renote_target = None;
        if let Some(quoted) = item.quoted_item.as_deref() {
            text = remove_quote_link(&text, &quoted.id);
            match self.dedup.get(&quoted.id).await? {
                Some(post_id) => {
                    debug!("{} quotes mirrored {} ({})", item.id, quoted.id, post_id);
                    renote_target = Some(post_id);
                }
                None => match self.embed_quote(quoted).await {
                    Ok((quote_text, quote_ids)) => {
                        text = format!("{}\n\n{}", text, quote_text);
                        attachment_ids.extend(quote_ids);
                    }
                    Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                    Err(e) => {
                        warn!("Could not embed quoted item {}: {}", quoted.id, e);
                        text = format!("{}\n\n{}", text, QUOTE_UNAVAILABLE);
                    }
                },
            }
        }

        if item.quoted_item.is_none() {
            if let Some(quoted_id) = item.unavailable_quote_id.as_deref() {
                debug!("{} quotes {:?}, which could not be decoded", item.id, quoted_id);
                if !quoted_id.is_empty() {
                    text = remove_quote_link(&text, quoted_id);
                }
                text = format!("{}\n\n{}", text, QUOTE_UNAVAILABLE);
            }
        }

        let text = self.text.with_backlink(&text, &item_url(&item.author.handle, &item.id));
        let request = PublishRequest {
            text: Some(text),
            attachment_ids,
            reply_target,
            renote_target,
            ..self.base_request()
        };

        match self.publisher.publish_or_skip(&request, &item.id, &self.skip).await? {
            PublishOutcome::Published { post_id } => {
                self.dedup.put(&item.id, &post_id, Ownership::SelfAuthored, &self.handle).await?;
                Ok(ItemOutcome::Published { post_id })
            }
            PublishOutcome::Skipped { reason } => Ok(ItemOutcome::Skipped { reason }),
        }
    }

    /// Text and attachments of an unmirrored quoted item
    async fn embed_quote(&self, quoted: &SourceItem) -> Result<(String, Vec<String>)> {
        if quoted.text.trim().is_empty() && quoted.media.is_empty() {
            return Err(MirrorError::Decode(format!("quoted item {} has no content", quoted.id)));
        }
        let body = self.text.compose_quote(quoted);
        let media = self
            .media
            .process(quoted, &body, &self.publisher, &self.cancel)
            .await?;
        Ok((media.text, media.attachment_ids))
    }

    fn base_request(&self) -> PublishRequest {
        PublishRequest {
            visibility: self.note.visibility,
            local_only: self.note.local_only,
            ..Default::default()
        }
    }

    /// Mirror avatar and banner changes. Failures leave the cached URL alone
    /// so the next cycle tries again.
    async fn sync_profile(&self, user: &SourceUser, state: &mut WatermarkState) {
        if self.profile.avatar {
            if let Some(url) = user.profile_image_url.as_deref().map(upgrade_avatar_url) {
                if state.profile_image_url.as_deref() != Some(url.as_str()) {
                    match self.replace_profile_asset(&url, ProfileAsset::Avatar).await {
                        Ok(()) => state.profile_image_url = Some(url),
                        Err(e) => warn!("Avatar update for @{} failed: {}", self.handle, e),
                    }
                }
            }
        }

        if self.profile.banner {
            if let Some(url) = user.profile_banner_url.clone() {
                if state.profile_banner_url.as_deref() != Some(url.as_str()) {
                    match self.replace_profile_asset(&url, ProfileAsset::Banner).await {
                        Ok(()) => state.profile_banner_url = Some(url),
                        Err(e) => warn!("Banner update for @{} failed: {}", self.handle, e),
                    }
                }
            }
        }
    }

    async fn replace_profile_asset(&self, url: &str, asset: ProfileAsset) -> Result<()> {
        info!("Updating {} for @{} from {}", asset.label(), self.handle, url);
        let (data, ext) = self.media.still_image(url).await?;
        let name = format!("{}_{}.{}", self.handle, asset.label(), ext);
        let file_id = self.publisher.upload_file(data, &name, false).await?;
        match asset {
            ProfileAsset::Avatar => self.publisher.update_account(Some(&file_id), None).await,
            ProfileAsset::Banner => self.publisher.update_account(None, Some(&file_id)).await,
        }
    }

    /// Apply a pinned-item change. The previous pin is always removed before
    /// the new one is set.
    async fn commit_pinned(&self, change: PinnedChange, state: &mut WatermarkState) -> Result<()> {
        match change {
            PinnedChange::Unchanged => {}
            PinnedChange::Cleared => {
                info!("@{} no longer has a pinned item", self.handle);
                if let Some(old) = state.pinned_post_id.take() {
                    if let Err(e) = self.publisher.unpin(&old).await {
                        warn!("Unpinning {} failed: {}", old, e);
                    }
                }
                state.pinned_item_id = None;
            }
            PinnedChange::Changed { item_id } => {
                state.pinned_item_id = Some(item_id.clone());
                let Some(post_id) = self.dedup.get(&item_id).await? else {
                    warn!("Pinned item {} has no mirrored post; pin left unchanged", item_id);
                    return Ok(());
                };
                if state.pinned_post_id.as_deref() == Some(post_id.as_str()) {
                    return Ok(());
                }

                if let Some(old) = state.pinned_post_id.clone() {
                    match self.publisher.unpin(&old).await {
                        Ok(()) => state.pinned_post_id = None,
                        Err(e) => warn!("Unpinning {} failed: {}", old, e),
                    }
                }
                match self.publisher.pin(&post_id).await {
                    Ok(()) => {
                        info!("Pinned {} (item {})", post_id, item_id);
                        state.pinned_post_id = Some(post_id);
                    }
                    Err(e) => {
                        // forget the item so the next cycle sees the change again
                        warn!("Pinning {} failed: {}", post_id, e);
                        state.pinned_item_id = None;
                    }
                }
            }
        }
        Ok(())
    }
}
