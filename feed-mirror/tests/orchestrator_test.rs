mod common;

use common::{at, authored_by, init_tracing, item, json_bodies, request_paths, user, FakeSource, NoteIds};
use feed_mirror::config::{AccountConfig, MediaConfig, RetrySettings};
use feed_mirror::{
    Config, DedupIndex, ErrorKind, MediaItem, MediaPipeline, Ownership, SourceItem, SyncOrchestrator,
    SyncResources, WatermarkState, WatermarkStore,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct Harness {
    server: MockServer,
    _dir: TempDir,
    config: Config,
    resources: SyncResources,
    dedup: Arc<DedupIndex>,
    watermarks: Arc<WatermarkStore>,
    cancel: CancellationToken,
    orchestrator: SyncOrchestrator,
}

impl Harness {
    /// A new orchestrator over the same storage, as after a restart
    fn restarted(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(&self.config.accounts[0], &self.config, &self.resources, CancellationToken::new())
            .unwrap()
    }
}

/// Hands out note ids like [`NoteIds`] and requests shutdown on every call
struct ShutdownAfterReply {
    ids: NoteIds,
    cancel: CancellationToken,
}

impl Respond for ShutdownAfterReply {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.cancel.cancel();
        self.ids.respond(request)
    }
}

fn quick_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 2,
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 2,
        rate_limit_step_ms: 1,
        rate_limit_max_ms: 2,
    }
}

/// Orchestrator for @alice against a fresh mock target. `notes` answers
/// note creation; pin endpoints always succeed.
async fn harness(source: FakeSource, notes: NoteReply, watermark: Option<WatermarkState>) -> Harness {
    init_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let notes_mock = Mock::given(method("POST")).and(path("/api/notes/create"));
    match notes {
        NoteReply::Ids => notes_mock.respond_with(NoteIds::new()).mount(&server).await,
        NoteReply::IdsThenShutdown => {
            let responder = ShutdownAfterReply {
                ids: NoteIds::new(),
                cancel: cancel.clone(),
            };
            notes_mock.respond_with(responder).mount(&server).await
        }
        NoteReply::Fixed(template) => notes_mock.respond_with(template).mount(&server).await,
    }
    for endpoint in ["/api/i/pin", "/api/i/unpin"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
    }

    let mut config = Config {
        accounts: vec![AccountConfig {
            handle: "alice".to_string(),
            target_host: server.uri(),
            target_token: "tok".to_string(),
        }],
        media: MediaConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-for-tests"),
            ..MediaConfig::default()
        },
        ..Config::default()
    };
    config.crawl.page_pause_ms = 0;
    config.note.interval_secs = 0;
    config.note.skip_backoff_secs = 0;
    config.profile.avatar = false;
    config.profile.banner = false;
    config.retry.source = quick_retry();
    config.retry.target = quick_retry();
    config.storage.data_dir = dir.path().to_path_buf();

    let dedup = Arc::new(DedupIndex::new("sqlite::memory:").await.unwrap());
    let watermarks = Arc::new(WatermarkStore::new(dir.path()));
    if let Some(state) = watermark {
        watermarks.save("alice", &state).await.unwrap();
    }

    let resources = SyncResources {
        source: Arc::new(source),
        dedup: dedup.clone(),
        watermarks: watermarks.clone(),
        media: Arc::new(MediaPipeline::new(config.media.clone(), config.nsfw.clone()).unwrap()),
    };
    let orchestrator = SyncOrchestrator::new(&config.accounts[0], &config, &resources, cancel.clone()).unwrap();

    Harness {
        server,
        _dir: dir,
        config,
        resources,
        dedup,
        watermarks,
        cancel,
        orchestrator,
    }
}

enum NoteReply {
    Ids,
    /// Answers like `Ids`, then requests shutdown
    IdsThenShutdown,
    Fixed(ResponseTemplate),
}

fn watermark_at(minutes: i64) -> Option<WatermarkState> {
    Some(WatermarkState {
        last_processed_at: Some(at(minutes)),
        ..WatermarkState::default()
    })
}

fn retweet(id: &str, minutes: i64, original: SourceItem) -> SourceItem {
    let mut rt = item(id, minutes, &format!("RT @{}: {}", original.author.handle, original.text));
    rt.retweeted_item = Some(Box::new(original));
    rt
}

#[tokio::test]
async fn test_first_run_bootstraps_without_publishing() {
    let source = FakeSource::new(user(&[]), vec![item("1", 10, "old"), item("2", 20, "older news")]);
    let h = harness(source, NoteReply::Ids, None).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert!(report.bootstrapped);
    assert!(request_paths(&h.server).await.is_empty());
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(20)));
}

#[tokio::test]
async fn test_new_items_published_oldest_first_and_indexed() {
    let source = FakeSource::new(
        user(&[]),
        vec![item("1", 10, "seen"), item("3", 30, "third"), item("2", 20, "second")],
    );
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(report.scanned, 2);

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert_eq!(notes.len(), 2);
    assert!(notes[0]["text"].as_str().unwrap().starts_with("second\nX : "));
    assert!(notes[1]["text"].as_str().unwrap().starts_with("third\nX : "));

    assert_eq!(h.dedup.get("2").await.unwrap(), Some("note-1".to_string()));
    assert_eq!(h.dedup.get("3").await.unwrap(), Some("note-2".to_string()));
    assert_eq!(h.dedup.get("1").await.unwrap(), None);
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(30)));
}

#[tokio::test]
async fn test_mirrored_retweet_renoted_once_per_run() {
    let original = authored_by(item("orig", 5, "carol's post"), "carol");
    let source = FakeSource::new(user(&[]), vec![retweet("rt1", 20, original)]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;
    h.dedup.put("orig", "note-orig", Ownership::SelfAuthored, "carol").await.unwrap();

    let first = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(first.renoted, 1);

    // same watermark again: still a renote, never a text repost
    h.watermarks
        .save("alice", &watermark_at(15).unwrap())
        .await
        .unwrap();
    let second = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.renoted, 1);

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert_eq!(notes.len(), 2);
    for note in &notes {
        assert_eq!(note["renoteId"], "note-orig");
        assert!(note.get("text").is_none());
    }
}

#[tokio::test]
async fn test_unmirrored_retweet_posts_text_and_indexes_both_ids() {
    let original = authored_by(item("orig", 5, "hello from @dave"), "carol");
    let source = FakeSource::new(user(&[]), vec![retweet("rt1", 20, original)]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    let text = notes[0]["text"].as_str().unwrap();
    assert!(text.starts_with("RT ?[@carol](https://x.com/carol): hello from ?[@dave](https://x.com/dave)"));
    assert!(text.ends_with("?[https://x.com/carol/status/orig](https://x.com/carol/status/orig)"));

    let own = h.dedup.record("rt1").await.unwrap().unwrap();
    assert_eq!(own.ownership, Ownership::SelfAuthored);
    let mirrored = h.dedup.record("orig").await.unwrap().unwrap();
    assert_eq!(mirrored.ownership, Ownership::MirroredRetweet);
    assert_eq!(mirrored.target_post_id, own.target_post_id);
}

#[tokio::test]
async fn test_exhausted_publish_skipped_and_watermark_advanced() {
    let source = FakeSource::new(user(&[]), vec![item("9", 40, "doomed")]);
    let h = harness(
        source,
        NoteReply::Fixed(ResponseTemplate::new(503)),
        watermark_at(15),
    )
    .await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.dedup.get("9").await.unwrap(), None);
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(40)));
    // two transport attempts for each of three note attempts
    assert_eq!(json_bodies(&h.server, "/api/notes/create").await.len(), 6);
}

#[tokio::test]
async fn test_rejected_publish_skipped_after_single_request() {
    let source = FakeSource::new(user(&[]), vec![item("9", 40, "too long"), item("10", 50, "fine")]);
    let h = harness(
        source,
        NoteReply::Fixed(ResponseTemplate::new(400).set_body_json(json!({ "error": {} }))),
        watermark_at(15),
    )
    .await;

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(json_bodies(&h.server, "/api/notes/create").await.len(), 2);
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(50)));
}

#[tokio::test]
async fn test_new_pin_replaces_old_pin_in_order() {
    let source = FakeSource::new(user(&["p1"]), vec![item("p1", 20, "pin me")]);
    let state = WatermarkState {
        last_processed_at: Some(at(15)),
        pinned_item_id: Some("old".to_string()),
        pinned_post_id: Some("note-old".to_string()),
        ..WatermarkState::default()
    };
    let h = harness(source, NoteReply::Ids, Some(state)).await;

    h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(
        request_paths(&h.server).await,
        vec!["/api/notes/create", "/api/i/unpin", "/api/i/pin"]
    );
    assert_eq!(json_bodies(&h.server, "/api/i/unpin").await[0]["noteId"], "note-old");
    assert_eq!(json_bodies(&h.server, "/api/i/pin").await[0]["noteId"], "note-1");

    let saved = h.watermarks.load("alice").await.unwrap();
    assert_eq!(saved.pinned_item_id.as_deref(), Some("p1"));
    assert_eq!(saved.pinned_post_id.as_deref(), Some("note-1"));
}

#[tokio::test]
async fn test_cleared_pin_unpins_and_forgets() {
    let source = FakeSource::new(user(&[]), Vec::new());
    let state = WatermarkState {
        last_processed_at: Some(at(15)),
        pinned_item_id: Some("old".to_string()),
        pinned_post_id: Some("note-old".to_string()),
        ..WatermarkState::default()
    };
    let h = harness(source, NoteReply::Ids, Some(state)).await;

    h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(request_paths(&h.server).await, vec!["/api/i/unpin"]);
    let saved = h.watermarks.load("alice").await.unwrap();
    assert_eq!(saved.pinned_item_id, None);
    assert_eq!(saved.pinned_post_id, None);
}

#[tokio::test]
async fn test_reply_and_quote_linkage() {
    let mut reply = item("20", 20, "agreed");
    reply.reply_to_id = Some("parent".to_string());
    let mut quote = item("21", 21, "look at this https://x.com/carol/status/q1");
    quote.quoted_item = Some(Box::new(authored_by(item("q1", 1, "quoted words"), "carol")));
    let mut orphan_reply = item("22", 22, "who?");
    orphan_reply.reply_to_id = Some("77".to_string());

    let source = FakeSource::new(user(&[]), vec![reply, quote, orphan_reply]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;
    h.dedup.put("parent", "note-parent", Ownership::SelfAuthored, "alice").await.unwrap();

    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.published, 3);

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert_eq!(notes[0]["replyId"], "note-parent");
    assert!(notes[0]["text"].as_str().unwrap().starts_with("agreed\nX : "));

    let quote_text = notes[1]["text"].as_str().unwrap();
    assert!(notes[1].get("renoteId").is_none());
    assert!(quote_text.starts_with("look at this\n\nQT ?[@carol](https://x.com/carol): quoted words\nX : "));

    assert!(notes[2].get("replyId").is_none());
    assert!(notes[2]["text"]
        .as_str()
        .unwrap()
        .starts_with("Reply to : https://x.com/x/status/77\n\nwho?"));
}

#[tokio::test]
async fn test_quote_of_mirrored_item_becomes_quote_renote() {
    let mut quote = item("30", 30, "so true https://x.com/carol/status/q2");
    quote.quoted_item = Some(Box::new(authored_by(item("q2", 2, "wise words"), "carol")));
    let source = FakeSource::new(user(&[]), vec![quote]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;
    h.dedup.put("q2", "note-q2", Ownership::MirroredRetweet, "alice").await.unwrap();

    h.orchestrator.run_cycle().await.unwrap();

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert_eq!(notes[0]["renoteId"], "note-q2");
    let text = notes[0]["text"].as_str().unwrap();
    assert!(text.starts_with("so true\nX : "));
    assert!(!text.contains("QT "));
}

#[tokio::test]
async fn test_undecodable_quote_marked_unavailable() {
    let mut quote = item("31", 31, "hmm https://x.com/dan/status/q9");
    quote.unavailable_quote_id = Some("q9".to_string());
    let source = FakeSource::new(user(&[]), vec![quote]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;

    h.orchestrator.run_cycle().await.unwrap();

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert!(notes[0]["text"]
        .as_str()
        .unwrap()
        .starts_with("hmm\n\nQT: (quoted item unavailable)\nX : "));
}

#[tokio::test]
async fn test_shutdown_during_media_leaves_item_unpublished() {
    let mut photo_post = item("50", 50, "photo post https://t.co/p1");
    photo_post.media = vec![MediaItem::Photo {
        url: "https://pbs.twimg.com/media/AAA.jpg".to_string(),
    }];
    let source = FakeSource::new(user(&[]), vec![photo_post.clone()]);
    let h = harness(source, NoteReply::Ids, watermark_at(15)).await;

    h.cancel.cancel();
    let err = h.orchestrator.process_item(&photo_post).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    assert!(request_paths(&h.server).await.is_empty());
    assert_eq!(h.dedup.get("50").await.unwrap(), None);
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(15)));
}

#[tokio::test]
async fn test_interrupted_cycle_resumes_after_last_committed_item() {
    let source = FakeSource::new(
        user(&[]),
        vec![item("1", 20, "first"), item("2", 30, "second"), item("3", 40, "third")],
    );
    let h = harness(source, NoteReply::IdsThenShutdown, watermark_at(15)).await;

    // shutdown arrives while the first note is in flight
    let report = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(20)));
    assert_eq!(json_bodies(&h.server, "/api/notes/create").await.len(), 1);

    let resumed = h.restarted().run_cycle().await.unwrap();
    assert_eq!(resumed.published, 2);

    let notes = json_bodies(&h.server, "/api/notes/create").await;
    assert_eq!(notes.len(), 3);
    assert!(notes[1]["text"].as_str().unwrap().starts_with("second\n"));
    assert!(notes[2]["text"].as_str().unwrap().starts_with("third\n"));
    assert_eq!(h.dedup.get("1").await.unwrap(), Some("note-1".to_string()));
    assert_eq!(h.dedup.get("3").await.unwrap(), Some("note-3".to_string()));
    assert_eq!(h.watermarks.load("alice").await.unwrap().last_processed_at, Some(at(40)));
}
