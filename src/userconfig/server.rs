//! Serving side of the user-config REST.
//!
//! Bearer-auth axum routes over the user store and the token-usage
//! aggregates. Workers call `GET /config/{platform}/{username}`; the rest
//! of the surface backs the operator dashboard.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::error::Result;
use crate::llm::LlmConfig;
use crate::log_warn;
use crate::telemetry::TokenUsageService;
use crate::userconfig::encryption;

/// One per-user row, API key encrypted at rest.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub username: String,
    pub platform: String,
    pub is_active: bool,
    pub llm_model: Option<String>,
    pub encrypted_api_key: Option<String>,
    pub additional_system_prompt: Option<String>,
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    /// Open the store at `DATABASE_URL` (path form) or the given default.
    pub fn open(default_path: &Path) -> Result<Self> {
        let path = std::env::var("DATABASE_URL")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| default_path.to_path_buf());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT NOT NULL,
                 platform TEXT NOT NULL,
                 is_active INTEGER NOT NULL DEFAULT 1,
                 llm_model TEXT,
                 encrypted_api_key TEXT,
                 additional_system_prompt TEXT,
                 UNIQUE (username, platform)
             )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, platform: &str, username: &str) -> Result<Option<UserRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT username, platform, is_active, llm_model, encrypted_api_key,
                        additional_system_prompt
                 FROM users WHERE username = ?1 AND platform = ?2",
                params![username, platform],
                |row| {
                    Ok(UserRow {
                        username: row.get(0)?,
                        platform: row.get(1)?,
                        is_active: row.get::<_, i64>(2)? != 0,
                        llm_model: row.get(3)?,
                        encrypted_api_key: row.get(4)?,
                        additional_system_prompt: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or replace a per-user row, sealing the API key at rest.
    pub fn upsert(&self, row: &UserRow, plaintext_api_key: Option<&str>) -> Result<()> {
        let key = encryption::resolve_key();
        let encrypted = match plaintext_api_key {
            Some(value) => Some(encryption::encrypt_value(value, &key)?),
            None => row.encrypted_api_key.clone(),
        };
        self.conn.lock().execute(
            "INSERT INTO users (username, platform, is_active, llm_model,
                                encrypted_api_key, additional_system_prompt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (username, platform) DO UPDATE SET
                 is_active = excluded.is_active,
                 llm_model = excluded.llm_model,
                 encrypted_api_key = excluded.encrypted_api_key,
                 additional_system_prompt = excluded.additional_system_prompt",
            params![
                row.username,
                row.platform,
                i64::from(row.is_active),
                row.llm_model,
                encrypted,
                row.additional_system_prompt,
            ],
        )?;
        Ok(())
    }
}

/// Ambient defaults served when no per-user row exists.
#[derive(Debug, Clone)]
pub struct ApiDefaults {
    pub llm: LlmConfig,
    pub system_prompt: String,
    pub max_llm_process_num: usize,
}

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<UserStore>,
    pub usage: Arc<TokenUsageService>,
    pub api_key: String,
    pub defaults: Arc<ApiDefaults>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/config/{platform}/{username}", get(get_user_config))
        .route("/token-usage/summary", get(get_usage_summary))
        .route("/token-usage/{username}", get(get_user_usage))
        .route("/token-usage/{username}/history", get(get_user_history))
        .with_state(state)
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    !expected.is_empty() && token.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "reason": "invalid token"})),
    )
        .into_response()
}

async fn get_user_config(
    State(state): State<ApiState>,
    UrlPath((platform, username)): UrlPath<(String, String)>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }

    let defaults = &state.defaults;
    let mut llm = defaults.llm.clone();
    let mut system_prompt = defaults.system_prompt.clone();

    match state.store.get(&platform, &username) {
        Ok(Some(user)) if user.is_active => {
            if let Some(model) = &user.llm_model {
                if !model.is_empty() {
                    llm.model = model.clone();
                }
            }
            if let Some(encrypted) = &user.encrypted_api_key {
                let key = encryption::resolve_key();
                match encryption::decrypt_value(encrypted, &key) {
                    Ok(api_key) if !api_key.is_empty() => llm.api_key = Some(api_key),
                    Ok(_) => {}
                    Err(e) => log_warn!("stored API key for {username} failed to decrypt: {e}"),
                }
            }
            if let Some(extra) = &user.additional_system_prompt {
                if !extra.is_empty() {
                    system_prompt = format!("{system_prompt}\n\n{extra}");
                }
            }
        }
        Ok(_) => {}
        Err(e) => log_warn!("user lookup failed for {username}: {e}"),
    }

    Json(json!({
        "status": "success",
        "data": {
            "llm": llm,
            "system_prompt": system_prompt,
            "max_llm_process_num": defaults.max_llm_process_num,
        }
    }))
    .into_response()
}

async fn get_user_usage(
    State(state): State<ApiState>,
    UrlPath(username): UrlPath<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }
    let usage = state.usage.get_user_token_usage(&username);
    Json(json!({"status": "success", "data": usage})).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    30
}

async fn get_user_history(
    State(state): State<ApiState>,
    UrlPath(username): UrlPath<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }
    let history = state.usage.get_user_daily_history(&username, query.days);
    Json(json!({"status": "success", "data": history})).into_response()
}

async fn get_usage_summary(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> axum::response::Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }
    let users = state.usage.get_all_users_token_usage();
    let response: Value = json!({
        "status": "success",
        "data": {
            "total_count": users.len(),
            "users": users,
            "last_updated": chrono::Utc::now().to_rfc3339(),
        }
    });
    Json(response).into_response()
}
