//! Webhook ingress.
//!
//! Two endpoints per forge plus a health endpoint. Every request runs the
//! same pipeline: authenticate, filter by event type, filter by action,
//! filter by label, then construct a descriptor and enqueue it. Invalid
//! signatures return 401; filtered events return 200 with a
//! machine-readable reason; successful enqueues echo the descriptor.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AgentError, Result};
use crate::queue::TaskQueue;
use crate::task::{extract_label_names, TaskDescriptor, TaskKey};
use crate::{log_debug, log_info, log_warn};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 validator for the hosted forge. The secret is mandatory
/// when the endpoint is mounted.
pub struct GitHubSignatureValidator {
    secret: String,
}

impl GitHubSignatureValidator {
    pub fn new(secret: String) -> Result<Self> {
        if secret.is_empty() {
            return Err(AgentError::Config(
                "GITHUB_WEBHOOK_SECRET is not configured".to_string(),
            ));
        }
        Ok(Self { secret })
    }

    /// Constant-time check of `sha256=<hex>` over the raw body.
    pub fn validate(&self, payload: &[u8], signature: Option<&str>) -> bool {
        let Some(signature) = signature else {
            return false;
        };
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);

        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        let expected = hex_encode(&mac.finalize().into_bytes());
        expected
            .as_bytes()
            .ct_eq(signature.to_lowercase().as_bytes())
            .into()
    }
}

/// Shared-token validator for the self-hosted forge. An unconfigured token
/// always fails rather than allowing an empty-token bypass.
pub struct GitLabTokenValidator {
    token: Option<String>,
}

impl GitLabTokenValidator {
    pub fn new(token: Option<String>) -> Self {
        let token = token.filter(|t| !t.is_empty());
        Self { token }
    }

    pub fn validate(&self, provided: Option<&str>) -> bool {
        let (Some(expected), Some(provided)) = (self.token.as_deref(), provided) else {
            return false;
        };
        expected.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct WebhookState {
    pub queue: Arc<dyn TaskQueue>,
    pub github_bot_label: String,
    pub gitlab_bot_label: String,
    pub github_validator: Option<GitHubSignatureValidator>,
    pub gitlab_validator: GitLabTokenValidator,
    pub gitlab_system_validator: GitLabTokenValidator,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/github", post(github_webhook))
        .route("/webhook/gitlab", post(gitlab_webhook))
        .route("/webhook/gitlab/system", post(gitlab_system_webhook))
        .with_state(state)
}

/// Bind and serve until the future is dropped or the listener fails.
pub async fn serve(state: Arc<WebhookState>, host: &str, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    log_info!("webhook server listening on {host}:{port}");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

fn ignored(reason: &str) -> Response {
    log_debug!("webhook event ignored: {reason}");
    Json(json!({"status": "ignored", "reason": reason})).into_response()
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": detail})),
    )
        .into_response()
}

fn malformed(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "error", "reason": reason})),
    )
        .into_response()
}

async fn enqueue(state: &WebhookState, key: TaskKey, user: Option<String>) -> Response {
    let descriptor = TaskDescriptor::new(key, user);
    match state.queue.put(&descriptor).await {
        Ok(()) => {
            log_info!("task enqueued from webhook: {}", descriptor.task_key);
            Json(json!({"status": "success", "task": descriptor})).into_response()
        }
        Err(e) => {
            log_warn!("webhook enqueue failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "reason": "enqueue failed"})),
            )
                .into_response()
        }
    }
}

async fn github_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    let valid = state
        .github_validator
        .as_ref()
        .is_some_and(|v| v.validate(&body, signature));
    if !valid {
        log_warn!("GitHub webhook signature validation failed");
        return unauthorized("Invalid signature");
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return malformed("invalid JSON payload");
    };
    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    log_info!(
        "received GitHub webhook: event={event}, action={}",
        payload.get("action").and_then(|v| v.as_str()).unwrap_or("")
    );

    if !matches!(event, "issues" | "pull_request") {
        return ignored("unsupported event type");
    }
    if payload.get("action").and_then(|v| v.as_str()) != Some("labeled") {
        return ignored("unsupported action");
    }
    let label = payload
        .get("label")
        .and_then(|l| l.get("name"))
        .and_then(|v| v.as_str());
    if label != Some(state.github_bot_label.as_str()) {
        return ignored("label mismatch");
    }

    let repository = payload.get("repository");
    let owner = repository
        .and_then(|r| r.get("owner"))
        .and_then(|o| o.get("login"))
        .and_then(|v| v.as_str());
    let repo = repository
        .and_then(|r| r.get("name"))
        .and_then(|v| v.as_str());
    let item = if event == "issues" {
        payload.get("issue")
    } else {
        payload.get("pull_request")
    };
    let number = item.and_then(|i| i.get("number")).and_then(Value::as_u64);
    let user = item
        .and_then(|i| i.get("user"))
        .and_then(|u| u.get("login"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    let (Some(owner), Some(repo), Some(number)) = (owner, repo, number) else {
        return malformed("malformed payload");
    };
    let key = if event == "issues" {
        TaskKey::GitHubIssue {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        }
    } else {
        TaskKey::GitHubPullRequest {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        }
    };
    enqueue(&state, key, user).await
}

async fn gitlab_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok());
    if !state.gitlab_validator.validate(token) {
        log_warn!("GitLab webhook token validation failed");
        return unauthorized("Invalid token");
    }
    process_gitlab(&state, &headers, &body).await
}

async fn gitlab_system_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok());
    if !state.gitlab_system_validator.validate(token) {
        log_warn!("GitLab system hook token validation failed");
        return unauthorized("Invalid token");
    }
    process_gitlab(&state, &headers, &body).await
}

async fn process_gitlab(state: &WebhookState, headers: &HeaderMap, body: &Bytes) -> Response {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return malformed("invalid JSON payload");
    };
    let event = headers
        .get("X-Gitlab-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    log_info!("received GitLab webhook: event={event}");

    if !matches!(event, "Issue Hook" | "Merge Request Hook") {
        return ignored("unsupported event type");
    }
    let attributes = payload.get("object_attributes");
    // GitLab reports label changes as an "update" action carrying the full
    // current label set.
    let action = attributes
        .and_then(|a| a.get("action"))
        .and_then(|v| v.as_str());
    if action != Some("update") {
        return ignored("unsupported action");
    }
    let labels = extract_label_names(&payload);
    if !labels.iter().any(|l| l == &state.gitlab_bot_label) {
        return ignored("label mismatch");
    }

    let project_id = payload
        .get("project")
        .and_then(|p| p.get("id"))
        .and_then(Value::as_u64);
    let iid = attributes.and_then(|a| a.get("iid")).and_then(Value::as_u64);
    let user = payload
        .get("user")
        .and_then(|u| u.get("username"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string);

    let (Some(project_id), Some(iid)) = (project_id, iid) else {
        return malformed("malformed payload");
    };
    let key = if event == "Issue Hook" {
        TaskKey::GitLabIssue { project_id, iid }
    } else {
        TaskKey::GitLabMergeRequest { project_id, iid }
    };
    enqueue(state, key, user).await
}
