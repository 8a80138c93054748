use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::util::ServiceExt;

use forgebot::queue::{InMemoryTaskQueue, TaskQueue};
use forgebot::task::TaskKey;
use forgebot::webhook::{
    router, GitHubSignatureValidator, GitLabTokenValidator, WebhookState,
};

const SECRET: &str = "hook-secret";
const GITLAB_TOKEN: &str = "gitlab-token";

fn state() -> (Arc<WebhookState>, Arc<InMemoryTaskQueue>) {
    let queue = Arc::new(InMemoryTaskQueue::new());
    let state = Arc::new(WebhookState {
        queue: queue.clone(),
        github_bot_label: "coding agent".to_string(),
        gitlab_bot_label: "coding agent".to_string(),
        github_validator: Some(
            GitHubSignatureValidator::new(SECRET.to_string()).expect("validator"),
        ),
        gitlab_validator: GitLabTokenValidator::new(Some(GITLAB_TOKEN.to_string())),
        gitlab_system_validator: GitLabTokenValidator::new(None),
    });
    (state, queue)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).expect("mac");
    mac.update(body);
    let hex: String = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    format!("sha256={hex}")
}

fn github_payload(action: &str, label: &str) -> Vec<u8> {
    json!({
        "action": action,
        "label": {"name": label},
        "issue": {"number": 1, "user": {"login": "alice"}},
        "repository": {"name": "widgets", "owner": {"login": "acme"}},
    })
    .to_string()
    .into_bytes()
}

fn github_request(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook/github")
        .header("content-type", "application/json")
        .header("X-GitHub-Event", "issues");
    if let Some(signature) = signature {
        builder = builder.header("X-Hub-Signature-256", signature);
    }
    builder.body(Body::from(body)).expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let (state, _) = state();
    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn invalid_signature_is_401_and_nothing_is_enqueued() {
    let (state, queue) = state();
    let body = github_payload("labeled", "coding agent");

    let response = router(state)
        .oneshot(github_request(body, Some("sha256=deadbeef")))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(queue.empty().await.expect("empty"));
}

#[tokio::test]
async fn missing_signature_is_401() {
    let (state, queue) = state();
    let response = router(state)
        .oneshot(github_request(github_payload("labeled", "coding agent"), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(queue.empty().await.expect("empty"));
}

#[tokio::test]
async fn valid_labeled_event_enqueues_a_descriptor() {
    let (state, queue) = state();
    let body = github_payload("labeled", "coding agent");
    let signature = sign(&body);

    let response = router(state)
        .oneshot(github_request(body, Some(&signature)))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "success");
    assert_eq!(json["task"]["task_key"]["type"], "github_issue");

    let descriptor = queue
        .try_get()
        .await
        .expect("get")
        .expect("descriptor enqueued");
    assert_eq!(
        descriptor.task_key,
        TaskKey::GitHubIssue {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            number: 1,
        }
    );
    assert_eq!(descriptor.user.as_deref(), Some("alice"));
}

#[tokio::test]
async fn non_labeled_action_is_ignored_with_reason() {
    let (state, queue) = state();
    let body = github_payload("opened", "coding agent");
    let signature = sign(&body);

    let response = router(state)
        .oneshot(github_request(body, Some(&signature)))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ignored");
    assert_eq!(json["reason"], "unsupported action");
    assert!(queue.empty().await.expect("empty"));
}

#[tokio::test]
async fn wrong_label_is_ignored_with_reason() {
    let (state, queue) = state();
    let body = github_payload("labeled", "bug");
    let signature = sign(&body);

    let response = router(state)
        .oneshot(github_request(body, Some(&signature)))
        .await
        .expect("response");

    let json = body_json(response).await;
    assert_eq!(json["status"], "ignored");
    assert_eq!(json["reason"], "label mismatch");
    assert!(queue.empty().await.expect("empty"));
}

fn gitlab_payload() -> Vec<u8> {
    json!({
        "object_attributes": {"iid": 5, "action": "update"},
        "labels": [{"title": "coding agent"}],
        "project": {"id": 77},
        "user": {"username": "carol"},
    })
    .to_string()
    .into_bytes()
}

fn gitlab_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("X-Gitlab-Event", "Merge Request Hook");
    if let Some(token) = token {
        builder = builder.header("X-Gitlab-Token", token);
    }
    builder.body(Body::from(gitlab_payload())).expect("request")
}

#[tokio::test]
async fn gitlab_valid_token_enqueues_merge_request_key() {
    let (state, queue) = state();
    let response = router(state)
        .oneshot(gitlab_request("/webhook/gitlab", Some(GITLAB_TOKEN)))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let descriptor = queue.try_get().await.expect("get").expect("descriptor");
    assert_eq!(
        descriptor.task_key,
        TaskKey::GitLabMergeRequest {
            project_id: 77,
            iid: 5,
        }
    );
    assert_eq!(descriptor.user.as_deref(), Some("carol"));
}

#[tokio::test]
async fn gitlab_wrong_or_missing_token_is_401() {
    let (state, queue) = state();
    let response = router(state.clone())
        .oneshot(gitlab_request("/webhook/gitlab", Some("wrong")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router(state)
        .oneshot(gitlab_request("/webhook/gitlab", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(queue.empty().await.expect("empty"));
}

#[tokio::test]
async fn unconfigured_system_hook_token_always_rejects() {
    // No system-hook token configured: even an empty token header must not
    // bypass validation.
    let (state, queue) = state();
    let response = router(state.clone())
        .oneshot(gitlab_request("/webhook/gitlab/system", Some("")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router(state)
        .oneshot(gitlab_request("/webhook/gitlab/system", Some("anything")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(queue.empty().await.expect("empty"));
}
