use crate::types::{Result, SourceItem, SourceUser};
use async_trait::async_trait;

/// One page of an account's timeline, newest item first
#[derive(Debug, Clone, Default)]
pub struct TimelinePage {
    pub items: Vec<SourceItem>,
    /// Opaque cursor for the next (older) page; `None` when exhausted
    pub next_cursor: Option<String>,
}

/// Contract for the source social feed.
///
/// Implementations decode raw platform payloads into [`SourceItem`] at this
/// boundary and classify their failures into [`crate::types::MirrorError`]
/// variants (rate limit, account unavailable, transient) so callers never
/// have to inspect error text.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Human-readable name for logging
    fn source_name(&self) -> String;

    /// Resolve an account by its handle
    async fn user_by_handle(&self, handle: &str) -> Result<SourceUser>;

    /// Fetch one page of the account's own posts; `cursor` is the value
    /// returned in a previous page's `next_cursor`
    async fn timeline_page(
        &self,
        user_id: &str,
        count: usize,
        cursor: Option<&str>,
    ) -> Result<TimelinePage>;

    /// Fetch a single item by id
    async fn item_by_id(&self, item_id: &str) -> Result<SourceItem>;
}

/// Rewrites an expanded URL before it is substituted into text
pub trait LinkSanitizer: Send + Sync {
    fn sanitize(&self, url: &str) -> String;
}
