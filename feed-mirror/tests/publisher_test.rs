mod common;

use common::{init_tracing, json_bodies, NoteIds};
use feed_mirror::config::RetrySettings;
use feed_mirror::{PublishClient, PublishOutcome, PublishRequest, RetryPolicy, SkipPolicy, Visibility};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetrySettings {
        max_attempts,
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 4,
        rate_limit_step_ms: 1,
        rate_limit_max_ms: 4,
    }
    .policy()
}

fn client(server: &MockServer, max_attempts: u32) -> PublishClient {
    PublishClient::new(&server.uri(), "secret", quick_policy(max_attempts), CancellationToken::new()).unwrap()
}

fn text_request(text: &str) -> PublishRequest {
    PublishRequest {
        text: Some(text.to_string()),
        visibility: Visibility::Home,
        local_only: true,
        ..Default::default()
    }
}

fn no_wait_skip(attempts: u32) -> SkipPolicy {
    SkipPolicy {
        attempts,
        backoff_step: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_create_note_sends_token_and_fields() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/notes/create"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(NoteIds::new())
        .expect(1)
        .mount(&server)
        .await;

    let request = PublishRequest {
        attachment_ids: vec!["f1".to_string()],
        reply_target: Some("parent".to_string()),
        ..text_request("hello")
    };
    let post_id = client(&server, 3).create_note(&request).await.unwrap();
    assert_eq!(post_id, "note-1");

    let body = &json_bodies(&server, "/api/notes/create").await[0];
    assert_eq!(body["i"], "secret");
    assert_eq!(body["text"], "hello");
    assert_eq!(body["visibility"], "home");
    assert_eq!(body["localOnly"], true);
    assert_eq!(body["fileIds"], json!(["f1"]));
    assert_eq!(body["replyId"], "parent");
    assert!(body.get("renoteId").is_none());
}

#[tokio::test]
async fn test_server_errors_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/notes/create"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/notes/create"))
        .respond_with(NoteIds::new())
        .mount(&server)
        .await;

    let post_id = client(&server, 5).create_note(&text_request("x")).await.unwrap();
    assert_eq!(post_id, "note-1");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_client_error_fails_after_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/notes/create"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": { "code": "INVALID_PARAM" } })))
        .mount(&server)
        .await;

    let publisher = client(&server, 5);
    assert!(publisher.create_note(&text_request("x")).await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let outcome = publisher
        .publish_or_skip(&text_request("x"), "item-1", &no_wait_skip(3))
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Skipped { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_publish_is_skipped_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/notes/create"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let outcome = client(&server, 2)
        .publish_or_skip(&text_request("x"), "item-9", &no_wait_skip(3))
        .await
        .unwrap();

    match outcome {
        PublishOutcome::Skipped { reason } => assert!(reason.contains("3 attempts")),
        other => panic!("expected skip, got {:?}", other),
    }
    // two transport attempts for each of three note-level attempts
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_upload_is_multipart_with_overwrite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/drive/files/create"))
        .and(body_string_contains("name=\"isSensitive\""))
        .and(body_string_contains("name=\"force\""))
        .and(body_string_contains("filename=\"42_0.jpg\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "file-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let file_id = client(&server, 3)
        .upload_file(b"jpeg bytes".to_vec(), "42_0.jpg", true)
        .await
        .unwrap();
    assert_eq!(file_id, "file-1");

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("jpeg bytes"));
    assert!(body.contains("secret"));
}

#[tokio::test]
async fn test_account_calls() {
    let server = MockServer::start().await;
    for endpoint in ["/api/i/update", "/api/i/pin", "/api/i/unpin"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/api/i"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "u1", "username": "mirror" })))
        .mount(&server)
        .await;

    let publisher = client(&server, 3);
    publisher.update_account(Some("file-9"), None).await.unwrap();
    publisher.pin("note-1").await.unwrap();
    publisher.unpin("note-0").await.unwrap();
    let identity = publisher.whoami().await.unwrap();
    assert_eq!(identity.username, "mirror");

    let update = &json_bodies(&server, "/api/i/update").await[0];
    assert_eq!(update["avatarId"], "file-9");
    assert!(update.get("bannerId").is_none());
    assert_eq!(json_bodies(&server, "/api/i/pin").await[0]["noteId"], "note-1");
    assert_eq!(json_bodies(&server, "/api/i/unpin").await[0]["noteId"], "note-0");
}

#[tokio::test]
async fn test_bare_host_gets_https_scheme() {
    let publisher =
        PublishClient::new("misskey.example/", "t", RetryPolicy::default(), CancellationToken::new()).unwrap();
    assert_eq!(publisher.host(), "misskey.example");
}
