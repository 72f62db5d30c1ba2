use crate::config::NoteConfig;
use crate::retry::RetryPolicy;
use crate::shutdown::sleep_or_cancel;
use crate::types::{ErrorKind, MirrorError, PublishOutcome, PublishRequest, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Account on the target instance the token belongs to
#[derive(Debug, Clone, Deserialize)]
pub struct TargetIdentity {
    pub id: String,
    pub username: String,
}

/// Note-level give-up rule layered over the per-call retry policy
#[derive(Debug, Clone)]
pub struct SkipPolicy {
    pub attempts: u32,
    pub backoff_step: Duration,
}

impl SkipPolicy {
    pub fn from_config(config: &NoteConfig) -> Self {
        Self {
            attempts: config.skip_after_failures.max(1),
            backoff_step: Duration::from_secs(config.skip_backoff_secs),
        }
    }
}

/// Client for the target instance's REST API.
///
/// Every call is a JSON POST to `/api/<endpoint>` carrying the token both as
/// a bearer header and as the `i` body field. Transient failures are retried
/// through `policy`; client errors fail on the first attempt.
pub struct PublishClient {
    client: Client,
    base_url: String,
    host: String,
    token: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PublishClient {
    pub fn new(host: &str, token: &str, policy: RetryPolicy, cancel: CancellationToken) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("feed-mirror/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };
        let parsed = url::Url::parse(&base)?;

        Ok(Self {
            client,
            host: parsed.host_str().unwrap_or(host).to_string(),
            base_url: format!("{}/api", base),
            token: token.to_string(),
            policy,
            cancel,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn endpoint(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Value> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&body)?);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(MirrorError::RateLimited { retry_after });
        }

        let body = response.text().await.unwrap_or_default();
        Err(MirrorError::Api {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn post_json_once(&self, endpoint: &str, payload: &Value) -> Result<Value> {
        let mut payload = payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("i".to_string(), Value::String(self.token.clone()));
        }

        let request = self
            .client
            .post(self.endpoint(endpoint))
            .timeout(METADATA_TIMEOUT)
            .json(&payload);
        self.send(endpoint, request).await
    }

    async fn post_json(&self, endpoint: &str, payload: Value) -> Result<Value> {
        let label = format!("{} {}", self.host, endpoint);
        self.policy
            .run(&label, &self.cancel, || self.post_json_once(endpoint, &payload))
            .await
    }

    /// Create a note, returning the new post id
    pub async fn create_note(&self, request: &PublishRequest) -> Result<String> {
        debug!(
            "notes/create: reply={:?} renote={:?} files={:?} text={:?}",
            request.reply_target,
            request.renote_target,
            request.attachment_ids,
            request.text.as_deref().map(|t| t.chars().take(30).collect::<String>())
        );

        let payload = serde_json::to_value(request)?;
        let response = self.post_json("notes/create", payload).await?;
        let post_id = response
            .pointer("/createdNote/id")
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::Decode("notes/create response has no createdNote.id".to_string()))?;
        Ok(post_id.to_string())
    }

    /// Upload a file to the drive, overwriting a same-named file. Returns the
    /// attachment id.
    pub async fn upload_file(&self, data: Vec<u8>, name: &str, sensitive: bool) -> Result<String> {
        let endpoint = "drive/files/create";
        let label = format!("{} upload {}", self.host, name);
        debug!("Uploading {} ({} bytes, sensitive={})", name, data.len(), sensitive);

        let response = self
            .policy
            .run(&label, &self.cancel, || {
                let form = Form::new()
                    .text("i", self.token.clone())
                    .text("isSensitive", sensitive.to_string())
                    .text("force", "true")
                    .text("name", name.to_string())
                    .part("file", Part::bytes(data.clone()).file_name(name.to_string()));
                let request = self
                    .client
                    .post(self.endpoint(endpoint))
                    .timeout(UPLOAD_TIMEOUT)
                    .multipart(form);
                self.send(endpoint, request)
            })
            .await?;

        let file_id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::Decode("drive/files/create response has no id".to_string()))?;
        info!("Uploaded {} as {}", name, file_id);
        Ok(file_id.to_string())
    }

    pub async fn update_account(&self, avatar_id: Option<&str>, banner_id: Option<&str>) -> Result<()> {
        let mut payload = json!({});
        if let Some(id) = avatar_id {
            payload["avatarId"] = json!(id);
        }
        if let Some(id) = banner_id {
            payload["bannerId"] = json!(id);
        }
        self.post_json("i/update", payload).await?;
        Ok(())
    }

    pub async fn pin(&self, post_id: &str) -> Result<()> {
        self.post_json("i/pin", json!({ "noteId": post_id })).await?;
        Ok(())
    }

    pub async fn unpin(&self, post_id: &str) -> Result<()> {
        self.post_json("i/unpin", json!({ "noteId": post_id })).await?;
        Ok(())
    }

    pub async fn whoami(&self) -> Result<TargetIdentity> {
        let response = self.post_json("i", json!({})).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Create a note, giving up after `skip.attempts` failed attempts.
    ///
    /// Exhaustion and client errors produce [`PublishOutcome::Skipped`] rather
    /// than an error so the caller can still advance past the item. Only
    /// cancellation is returned as an error.
    pub async fn publish_or_skip(
        &self,
        request: &PublishRequest,
        item_id: &str,
        skip: &SkipPolicy,
    ) -> Result<PublishOutcome> {
        let mut last_error = String::new();

        for attempt in 1..=skip.attempts {
            match self.create_note(request).await {
                Ok(post_id) => return Ok(PublishOutcome::Published { post_id }),
                Err(e) => match e.kind() {
                    ErrorKind::Cancelled => return Err(e),
                    ErrorKind::Client => {
                        error!("Publishing {} rejected, skipping: {}", item_id, e);
                        return Ok(PublishOutcome::Skipped {
                            reason: format!("rejected: {}", e),
                        });
                    }
                    _ => {
                        warn!("Publishing {} failed (attempt {}/{}): {}", item_id, attempt, skip.attempts, e);
                        last_error = e.to_string();
                    }
                },
            }

            if attempt < skip.attempts && !sleep_or_cancel(&self.cancel, skip.backoff_step * attempt).await {
                return Err(MirrorError::Cancelled);
            }
        }

        error!("Publishing {} failed {} times, skipping", item_id, skip.attempts);
        Ok(PublishOutcome::Skipped {
            reason: format!("gave up after {} attempts: {}", skip.attempts, last_error),
        })
    }
}
