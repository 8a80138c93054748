//! Task telemetry and token-usage aggregation.
//!
//! Every task run is recorded in a SQLite `tasks` table; the token-usage
//! service aggregates per-user totals out of the same table for the
//! user-config REST.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log_warn;
use crate::task::{TaskDescriptor, TaskKey};

/// Upper bound on users returned by the all-users summary.
const MAX_USERS_LIMIT: usize = 20;

const CREATE_TASKS_TABLE: &str = "CREATE TABLE IF NOT EXISTS tasks (
    uuid TEXT PRIMARY KEY,
    task_source TEXT,
    owner TEXT,
    repo TEXT,
    task_type TEXT,
    task_id INTEGER,
    status TEXT,
    created_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    process_id INTEGER,
    hostname TEXT,
    llm_provider TEXT,
    model TEXT,
    context_length INTEGER,
    llm_call_count INTEGER,
    tool_call_count INTEGER,
    total_tokens INTEGER,
    compression_count INTEGER,
    error_message TEXT,
    user TEXT
)";

/// Writer side: one row per task run.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(CREATE_TASKS_TABLE, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_start(&self, descriptor: &TaskDescriptor, model: &str) -> Result<()> {
        let (owner, repo, task_id) = key_columns(&descriptor.task_key);
        let task_type = if descriptor.task_key.is_issue() {
            "issue"
        } else {
            "change_request"
        };
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO tasks (
                 uuid, task_source, owner, repo, task_type, task_id, status,
                 created_at, started_at, process_id, hostname, model, user
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                descriptor.uuid.to_string(),
                descriptor.task_key.platform().as_str(),
                owner,
                repo,
                task_type,
                task_id,
                "processing",
                descriptor.enqueued_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                std::process::id(),
                hostname(),
                model,
                descriptor.user,
            ],
        )?;
        Ok(())
    }

    pub fn record_finish(
        &self,
        descriptor: &TaskDescriptor,
        status: &str,
        llm_call_count: u32,
        tool_call_count: u32,
        total_tokens: i64,
        compression_count: u32,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE tasks SET status = ?2, completed_at = ?3, llm_call_count = ?4,
                 tool_call_count = ?5, total_tokens = ?6, compression_count = ?7,
                 error_message = ?8
             WHERE uuid = ?1",
            params![
                descriptor.uuid.to_string(),
                status,
                Utc::now().to_rfc3339(),
                llm_call_count,
                tool_call_count,
                total_tokens,
                compression_count,
                error_message,
            ],
        )?;
        Ok(())
    }
}

fn key_columns(key: &TaskKey) -> (String, String, u64) {
    match key {
        TaskKey::GitHubIssue {
            owner,
            repo,
            number,
        }
        | TaskKey::GitHubPullRequest {
            owner,
            repo,
            number,
        } => (owner.clone(), repo.clone(), *number),
        TaskKey::GitLabIssue { project_id, iid }
        | TaskKey::GitLabMergeRequest { project_id, iid } => {
            (project_id.to_string(), String::new(), *iid)
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Per-user totals for the three rolling windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTokenUsage {
    pub username: String,
    pub today: i64,
    pub this_week: i64,
    pub this_month: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTokens {
    pub date: String,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyHistory {
    pub username: String,
    pub history: Vec<DailyTokens>,
    pub period_start: String,
    pub period_end: String,
}

/// Read side: aggregates over the `tasks` table. An absent database reads
/// as zero usage everywhere.
pub struct TokenUsageService {
    db_path: PathBuf,
}

impl TokenUsageService {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    fn connection(&self) -> Option<Connection> {
        if !self.db_path.exists() {
            log_warn!("tasks database not found at {}", self.db_path.display());
            return None;
        }
        Connection::open(&self.db_path).ok()
    }

    pub fn get_user_token_usage(&self, username: &str) -> UserTokenUsage {
        let now = Utc::now();
        let (today_start, week_start, month_start) = window_starts(now);

        let zero = UserTokenUsage {
            username: username.to_string(),
            today: 0,
            this_week: 0,
            this_month: 0,
            last_updated: now,
        };
        let Some(conn) = self.connection() else {
            return zero;
        };

        UserTokenUsage {
            today: tokens_since(&conn, username, &today_start),
            this_week: tokens_since(&conn, username, &week_start),
            this_month: tokens_since(&conn, username, &month_start),
            ..zero
        }
    }

    /// Daily token buckets for the trailing `days` window. `days` clamps to
    /// 1..=365; missing days read as zero.
    pub fn get_user_daily_history(&self, username: &str, days: i64) -> DailyHistory {
        let days = days.clamp(1, 365);
        let end_date = Utc::now().date_naive();
        let start_date = end_date - ChronoDuration::days(days - 1);

        let mut by_date = std::collections::HashMap::new();
        if let Some(conn) = self.connection() {
            let query = "SELECT DATE(created_at) AS day, SUM(total_tokens) AS tokens
                         FROM tasks
                         WHERE user = ?1 AND DATE(created_at) >= DATE(?2)
                         GROUP BY DATE(created_at)";
            if let Ok(mut stmt) = conn.prepare(query) {
                let rows = stmt.query_map(params![username, start_date.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    ))
                });
                if let Ok(rows) = rows {
                    for row in rows.flatten() {
                        by_date.insert(row.0, row.1.max(0));
                    }
                }
            }
        }

        let mut history = Vec::with_capacity(usize::try_from(days).unwrap_or_default());
        let mut current = start_date;
        while current <= end_date {
            let date = current.to_string();
            let tokens = by_date.get(&date).copied().unwrap_or(0);
            history.push(DailyTokens { date, tokens });
            current += ChronoDuration::days(1);
        }

        DailyHistory {
            username: username.to_string(),
            history,
            period_start: start_date.to_string(),
            period_end: end_date.to_string(),
        }
    }

    /// Top users by current-month tokens, each expanded to the three
    /// rolling-window totals.
    pub fn get_all_users_token_usage(&self) -> Vec<UserTokenUsage> {
        let Some(conn) = self.connection() else {
            return Vec::new();
        };
        let now = Utc::now();
        let (_, _, month_start) = window_starts(now);

        let query = "SELECT user, SUM(total_tokens) AS month_total
                     FROM tasks
                     WHERE user IS NOT NULL AND created_at >= ?1
                     GROUP BY user
                     ORDER BY month_total DESC
                     LIMIT ?2";
        let mut top_users = Vec::new();
        if let Ok(mut stmt) = conn.prepare(query) {
            let limit = i64::try_from(MAX_USERS_LIMIT).unwrap_or(20);
            if let Ok(rows) =
                stmt.query_map(params![month_start, limit], |row| row.get::<_, String>(0))
            {
                top_users.extend(rows.flatten());
            }
        }

        top_users
            .iter()
            .map(|user| self.get_user_token_usage(user))
            .collect()
    }
}

/// ISO timestamps for the start of today, this week (Monday), and this
/// month, in UTC.
fn window_starts(now: DateTime<Utc>) -> (String, String, String) {
    let today = now.date_naive();
    let week = today - ChronoDuration::days(i64::from(today.weekday().num_days_from_monday()));
    let month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);

    let to_ts = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().to_rfc3339())
            .unwrap_or_default()
    };
    (to_ts(today), to_ts(week), to_ts(month))
}

/// Sum of `total_tokens` since a timestamp; negative sums report as 0.
fn tokens_since(conn: &Connection, username: &str, since: &str) -> i64 {
    let total: rusqlite::Result<Option<i64>> = conn.query_row(
        "SELECT COALESCE(SUM(total_tokens), 0) FROM tasks
         WHERE user = ?1 AND created_at >= ?2",
        params![username, since],
        |row| row.get(0),
    );
    total.ok().flatten().unwrap_or(0).max(0)
}
