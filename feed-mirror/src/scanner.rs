use crate::retry::RetryPolicy;
use crate::shutdown::sleep_or_cancel;
use crate::traits::SourceFeed;
use crate::types::{ErrorKind, MirrorError, Result, SourceItem, SourceUser};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Items newer than the watermark, oldest first
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub items: Vec<SourceItem>,
    /// A later page failed; `items` holds what was collected before it
    pub partial: bool,
}

/// How the account's pinned item moved since the last cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinnedChange {
    Unchanged,
    Cleared,
    Changed { item_id: String },
}

/// Discovers new items on an account's timeline
pub struct FeedScanner {
    source: Arc<dyn SourceFeed>,
    policy: RetryPolicy,
    page_size: usize,
    page_pause: Duration,
}

impl FeedScanner {
    pub fn new(source: Arc<dyn SourceFeed>, policy: RetryPolicy, page_size: usize, page_pause: Duration) -> Self {
        Self {
            source,
            policy,
            page_size: page_size.max(1),
            page_pause,
        }
    }

    pub async fn user(&self, handle: &str, cancel: &CancellationToken) -> Result<SourceUser> {
        let label = format!("user_by_handle({})", handle);
        self.policy
            .run(&label, cancel, || self.source.user_by_handle(handle))
            .await
    }

    /// First run: the watermark starts at the newest existing item so history
    /// is never backfilled.
    pub async fn bootstrap(&self, user: &SourceUser, cancel: &CancellationToken) -> Result<DateTime<Utc>> {
        let label = format!("timeline_page({}) bootstrap", user.handle);
        let page = self
            .policy
            .run(&label, cancel, || self.source.timeline_page(&user.id, 1, None))
            .await?;

        let newest = page.items.iter().map(|item| item.created_at).max();
        Ok(newest.unwrap_or_else(Utc::now))
    }

    /// Walk the timeline backwards until an item at or below `watermark`
    /// appears or pages run out.
    pub async fn fetch(
        &self,
        user: &SourceUser,
        watermark: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let mut collected: Vec<SourceItem> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut partial = false;
        let mut page_number = 0usize;

        loop {
            page_number += 1;
            let label = format!("timeline_page({}) #{}", user.handle, page_number);
            let page = self
                .policy
                .run(&label, cancel, || {
                    self.source.timeline_page(&user.id, self.page_size, cursor.as_deref())
                })
                .await;

            let page = match page {
                Ok(page) => page,
                // Nothing collected yet, or the account itself is gone: the cycle cannot proceed
                Err(e) if page_number == 1 || is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!("[{}] Pagination failed on page {}, keeping {} items: {}", user.handle, page_number, collected.len(), e);
                    partial = true;
                    break;
                }
            };

            if page.items.is_empty() {
                debug!("[{}] Empty timeline page", user.handle);
                break;
            }

            let mut reached_watermark = false;
            for item in page.items {
                if item.created_at <= watermark {
                    reached_watermark = true;
                    break;
                }
                if seen.insert(item.id.clone()) {
                    collected.push(item);
                }
            }

            if reached_watermark {
                break;
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }

            if !sleep_or_cancel(cancel, self.page_pause).await {
                return Err(MirrorError::Cancelled);
            }
        }

        sort_chronological(&mut collected);
        info!("[{}] {} new items since {}", user.handle, collected.len(), watermark.to_rfc3339());
        Ok(ScanResult { items: collected, partial })
    }

    /// Compare the account's current pinned item against `stored_pinned`.
    /// A newly pinned item newer than the watermark is merged into `items`
    /// even when pagination did not surface it.
    pub async fn reconcile_pinned(
        &self,
        user: &SourceUser,
        stored_pinned: Option<&str>,
        watermark: DateTime<Utc>,
        items: &mut Vec<SourceItem>,
        cancel: &CancellationToken,
    ) -> Result<PinnedChange> {
        let stored_pinned = stored_pinned.filter(|id| !id.is_empty());

        let Some(current) = user.pinned_item_ids.first() else {
            return Ok(match stored_pinned {
                Some(_) => PinnedChange::Cleared,
                None => PinnedChange::Unchanged,
            });
        };

        if stored_pinned == Some(current.as_str()) {
            return Ok(PinnedChange::Unchanged);
        }

        info!("[{}] Pinned item changed: {:?} -> {}", user.handle, stored_pinned, current);

        let label = format!("item_by_id(pinned={})", current);
        match self.policy.run(&label, cancel, || self.source.item_by_id(current)).await {
            Ok(pinned) => {
                if pinned.created_at > watermark && !items.iter().any(|item| item.id == pinned.id) {
                    info!("[{}] Adding pinned item {} to the batch", user.handle, pinned.id);
                    items.push(pinned);
                }
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => warn!("[{}] Could not fetch pinned item {}: {}", user.handle, current, e),
        }

        Ok(PinnedChange::Changed {
            item_id: current.clone(),
        })
    }
}

fn is_fatal(e: &MirrorError) -> bool {
    matches!(e.kind(), ErrorKind::AccountUnavailable | ErrorKind::Cancelled)
}

/// Stable oldest-first ordering
pub fn sort_chronological(items: &mut [SourceItem]) {
    items.sort_by_key(|item| item.created_at);
}
