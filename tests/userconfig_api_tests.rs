use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::util::ServiceExt;

use forgebot::llm::LlmConfig;
use forgebot::telemetry::TokenUsageService;
use forgebot::userconfig::server::{router, ApiDefaults, ApiState, UserRow, UserStore};

const API_KEY: &str = "server-key";

fn state(dir: &std::path::Path) -> ApiState {
    let store = UserStore::open(&dir.join("users.db")).expect("store");
    ApiState {
        store: Arc::new(store),
        usage: Arc::new(TokenUsageService::new(&dir.join("tasks.db"))),
        api_key: API_KEY.to_string(),
        defaults: Arc::new(ApiDefaults {
            llm: LlmConfig {
                model: "ambient-model".to_string(),
                ..LlmConfig::default()
            },
            system_prompt: "ambient prompt".to_string(),
            max_llm_process_num: 4,
        }),
    }
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn missing_or_wrong_bearer_token_is_401() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(state(dir.path()));

    let response = app
        .clone()
        .oneshot(get("/config/github/alice", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get("/config/github/alice", Some("wrong")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_user_gets_ambient_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(state(dir.path()));

    let response = app
        .oneshot(get("/config/github/alice", Some(API_KEY)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "success");
    assert_eq!(json["data"]["llm"]["model"], "ambient-model");
    assert_eq!(json["data"]["system_prompt"], "ambient prompt");
    assert_eq!(json["data"]["max_llm_process_num"], 4);
}

#[tokio::test]
async fn per_user_row_overrides_model_and_decrypts_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api_state = state(dir.path());
    api_state
        .store
        .upsert(
            &UserRow {
                username: "alice".to_string(),
                platform: "github".to_string(),
                is_active: true,
                llm_model: Some("user-model".to_string()),
                encrypted_api_key: None,
                additional_system_prompt: Some("extra guidance".to_string()),
            },
            Some("sk-user-secret"),
        )
        .expect("upsert");

    let response = router(api_state)
        .oneshot(get("/config/github/alice", Some(API_KEY)))
        .await
        .expect("response");
    let json = body_json(response).await;

    assert_eq!(json["data"]["llm"]["model"], "user-model");
    // The stored key is encrypted at rest and comes back decrypted only on
    // this outgoing record.
    assert_eq!(json["data"]["llm"]["api_key"], "sk-user-secret");
    let prompt = json["data"]["system_prompt"].as_str().expect("prompt");
    assert!(prompt.starts_with("ambient prompt"));
    assert!(prompt.contains("extra guidance"));
}

#[tokio::test]
async fn inactive_user_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api_state = state(dir.path());
    api_state
        .store
        .upsert(
            &UserRow {
                username: "bob".to_string(),
                platform: "github".to_string(),
                is_active: false,
                llm_model: Some("user-model".to_string()),
                encrypted_api_key: None,
                additional_system_prompt: None,
            },
            None,
        )
        .expect("upsert");

    let response = router(api_state)
        .oneshot(get("/config/github/bob", Some(API_KEY)))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["data"]["llm"]["model"], "ambient-model");
}

#[tokio::test]
async fn token_usage_routes_respond_with_success_envelopes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(state(dir.path()));

    let response = app
        .clone()
        .oneshot(get("/token-usage/alice", Some(API_KEY)))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["status"], "success");
    assert_eq!(json["data"]["today"], 0);

    let response = app
        .clone()
        .oneshot(get("/token-usage/alice/history?days=3", Some(API_KEY)))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["data"]["history"].as_array().expect("series").len(), 3);

    let response = app
        .oneshot(get("/token-usage/summary", Some(API_KEY)))
        .await
        .expect("response");
    let json = body_json(response).await;
    assert_eq!(json["data"]["total_count"], 0);
}
