#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use feed_mirror::{
    MirrorError, Result, SourceAuthor, SourceFeed, SourceItem, SourceUser, TimelinePage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use wiremock::{Request, Respond, ResponseTemplate};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

pub fn item(id: &str, minutes: i64, text: &str) -> SourceItem {
    SourceItem {
        id: id.to_string(),
        text: text.to_string(),
        created_at: at(minutes),
        author: SourceAuthor {
            id: "100".to_string(),
            handle: "alice".to_string(),
        },
        media: Vec::new(),
        url_entities: Vec::new(),
        reply_to_id: None,
        quoted_item: None,
        unavailable_quote_id: None,
        retweeted_item: None,
    }
}

pub fn authored_by(mut item: SourceItem, handle: &str) -> SourceItem {
    item.author = SourceAuthor {
        id: format!("id-{}", handle),
        handle: handle.to_string(),
    };
    item
}

pub fn user(pinned: &[&str]) -> SourceUser {
    SourceUser {
        id: "100".to_string(),
        handle: "alice".to_string(),
        profile_image_url: None,
        profile_banner_url: None,
        pinned_item_ids: pinned.iter().map(|s| s.to_string()).collect(),
    }
}

/// In-memory timeline. Items are served newest first; the cursor is the
/// offset of the next page.
pub struct FakeSource {
    pub user: Mutex<SourceUser>,
    timeline: Mutex<Vec<SourceItem>>,
    by_id: Mutex<HashMap<String, SourceItem>>,
    fail_page: Mutex<Option<(usize, MirrorError)>>,
    pub page_calls: AtomicUsize,
    pub item_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(user: SourceUser, mut timeline: Vec<SourceItem>) -> Self {
        timeline.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let by_id = timeline.iter().map(|i| (i.id.clone(), i.clone())).collect();
        Self {
            user: Mutex::new(user),
            timeline: Mutex::new(timeline),
            by_id: Mutex::new(by_id),
            fail_page: Mutex::new(None),
            page_calls: AtomicUsize::new(0),
            item_calls: AtomicUsize::new(0),
        }
    }

    /// An item reachable by id but not on the timeline
    pub fn with_lookup_only(self, item: SourceItem) -> Self {
        self.by_id.lock().unwrap().insert(item.id.clone(), item);
        self
    }

    /// Every request for page `page` (1-based) fails with `error`
    pub fn failing_page(self, page: usize, error: MirrorError) -> Self {
        *self.fail_page.lock().unwrap() = Some((page, error));
        self
    }
}

fn clone_error(e: &MirrorError) -> MirrorError {
    match e {
        MirrorError::AccountUnavailable { handle, reason } => MirrorError::AccountUnavailable {
            handle: handle.clone(),
            reason: reason.clone(),
        },
        MirrorError::RateLimited { retry_after } => MirrorError::RateLimited {
            retry_after: *retry_after,
        },
        MirrorError::Api { endpoint, status, body } => MirrorError::Api {
            endpoint: endpoint.clone(),
            status: *status,
            body: body.clone(),
        },
        other => MirrorError::General(other.to_string()),
    }
}

#[async_trait]
impl SourceFeed for FakeSource {
    fn source_name(&self) -> String {
        "fake".to_string()
    }

    async fn user_by_handle(&self, _handle: &str) -> Result<SourceUser> {
        Ok(self.user.lock().unwrap().clone())
    }

    async fn timeline_page(&self, _user_id: &str, count: usize, cursor: Option<&str>) -> Result<TimelinePage> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let page_number = offset / count.max(1) + 1;

        if let Some((page, error)) = self.fail_page.lock().unwrap().as_ref() {
            if *page == page_number {
                return Err(clone_error(error));
            }
        }

        let timeline = self.timeline.lock().unwrap();
        let end = (offset + count).min(timeline.len());
        let items = timeline.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < timeline.len()).then(|| end.to_string());
        Ok(TimelinePage { items, next_cursor })
    }

    async fn item_by_id(&self, item_id: &str) -> Result<SourceItem> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        self.by_id
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .ok_or_else(|| MirrorError::Api {
                endpoint: "item".to_string(),
                status: 404,
                body: item_id.to_string(),
            })
    }
}

/// Answers note creation with `note-1`, `note-2`, ...
pub struct NoteIds {
    next: AtomicUsize,
}

impl NoteIds {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(1),
        }
    }
}

impl Respond for NoteIds {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "createdNote": { "id": format!("note-{}", n) }
        }))
    }
}

/// Paths of the requests a mock server saw, in arrival order
pub async fn request_paths(server: &wiremock::MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect()
}

pub async fn json_bodies(server: &wiremock::MockServer, path: &str) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == path)
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}
