//! GitLab adapter for the forge capability set.
//!
//! Issues and merge requests are addressed by project id + iid, comments are
//! notes, label deltas use the `add_labels`/`remove_labels` update fields,
//! and seed commits use the commits API with an empty action list.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::forge::{
    strip_url_fields, ChangeRequest, ForgeClient, ItemState, RepoRef, DEFAULT_REQUEST_TIMEOUT_SECS,
    MAX_REQUEST_RETRIES,
};
use crate::log_debug;
use crate::task::{Comment, CommentKind, Platform, TaskKey};

const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";

pub struct GitLabForge {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitLabForge {
    pub fn new(token: String, api_url: Option<String>) -> Result<Self> {
        if token.is_empty() {
            return Err(AgentError::Config(
                "GITLAB_PERSONAL_ACCESS_TOKEN is not set".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .user_agent("forgebot")
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token,
        })
    }

    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GITLAB_PERSONAL_ACCESS_TOKEN").unwrap_or_default();
        let api_url = std::env::var("GITLAB_API_URL").ok();
        Self::new(token, api_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_url))
            .header("PRIVATE-TOKEN", &self.token)
    }

    /// Send with bounded retries on transport failures and 429/5xx answers.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let mut last_error = AgentError::Transport("request was never sent".to_string());
        for attempt in 1..=MAX_REQUEST_RETRIES {
            let Some(request) = request.try_clone() else {
                return Err(AgentError::Transport(
                    "request body is not retryable".to_string(),
                ));
            };
            match request.send().await {
                Ok(response) => match check(response).await {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_retriable() && attempt < MAX_REQUEST_RETRIES => last_error = e,
                    Err(e) => return Err(e),
                },
                Err(e) if attempt < MAX_REQUEST_RETRIES => last_error = e.into(),
                Err(e) => return Err(e.into()),
            }
            log_debug!("retrying GitLab request ({attempt}/{MAX_REQUEST_RETRIES}): {last_error}");
        }
        Err(last_error)
    }

    fn item_path(key: &TaskKey) -> Result<(u64, &'static str, u64)> {
        match key {
            TaskKey::GitLabIssue { project_id, iid } => Ok((*project_id, "issues", *iid)),
            TaskKey::GitLabMergeRequest { project_id, iid } => {
                Ok((*project_id, "merge_requests", *iid))
            }
            _ => Err(AgentError::Config(format!("not a GitLab task key: {key}"))),
        }
    }

    fn project_id(repo: &RepoRef) -> Result<u64> {
        match repo {
            RepoRef::GitLab { project_id } => Ok(*project_id),
            RepoRef::GitHub { .. } => Err(AgentError::Config(
                "GitHub repo ref passed to the GitLab adapter".to_string(),
            )),
        }
    }

    /// Label delta through the item update endpoint.
    async fn update_labels(&self, key: &TaskKey, field: &str, label: &str) -> Result<()> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::PUT,
                &format!("/projects/{project_id}/{kind}/{iid}"),
            )
            .json(&json!({ field: label })),
        )
        .await
        .map(|_| ())
    }
}

async fn check(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    } else {
        let message = response.text().await.unwrap_or_default();
        Err(AgentError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn note_to_comment(raw: &Value, kind: CommentKind) -> Option<Comment> {
    let id = match raw.get("id")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let body = raw.get("body").and_then(|v| v.as_str())?;
    let author = raw
        .get("author")
        .and_then(|a| a.get("username"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let created_at = raw
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())?;
    Some(Comment {
        id,
        author: author.to_string(),
        body: body.to_string(),
        created_at,
        kind,
    })
}

#[async_trait]
impl ForgeClient for GitLabForge {
    fn platform(&self) -> Platform {
        Platform::GitLab
    }

    async fn list_items_with_label(
        &self,
        repo: &RepoRef,
        label: &str,
        state: ItemState,
    ) -> Result<Vec<(TaskKey, Value)>> {
        let project_id = Self::project_id(repo)?;
        let state = match state {
            ItemState::Open => "opened",
            ItemState::Closed => "closed",
        };
        let query = [
            ("labels", label.to_string()),
            ("state", state.to_string()),
            ("per_page", "100".to_string()),
        ];

        let mut out = Vec::new();
        for (kind, is_issue) in [("issues", true), ("merge_requests", false)] {
            let items = self
                .execute(
                    self.request(
                        reqwest::Method::GET,
                        &format!("/projects/{project_id}/{kind}"),
                    )
                    .query(&query),
                )
                .await?;
            for item in items.as_array().into_iter().flatten() {
                let Some(iid) = item.get("iid").and_then(Value::as_u64) else {
                    continue;
                };
                let key = if is_issue {
                    TaskKey::GitLabIssue { project_id, iid }
                } else {
                    TaskKey::GitLabMergeRequest { project_id, iid }
                };
                out.push((key, item.clone()));
            }
        }
        Ok(out)
    }

    async fn get_item(&self, key: &TaskKey) -> Result<Value> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        self.execute(self.request(
            reqwest::Method::GET,
            &format!("/projects/{project_id}/{kind}/{iid}"),
        ))
        .await
    }

    async fn get_comments(&self, key: &TaskKey) -> Result<Vec<Comment>> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        let notes = self
            .execute(
                self.request(
                    reqwest::Method::GET,
                    &format!("/projects/{project_id}/{kind}/{iid}/notes"),
                )
                .query(&[
                    ("per_page", "100"),
                    ("sort", "asc"),
                    ("order_by", "created_at"),
                ]),
            )
            .await?;

        let comment_kind = if matches!(key, TaskKey::GitLabMergeRequest { .. }) {
            CommentKind::InlineReview
        } else {
            CommentKind::IssueComment
        };
        let mut comments: Vec<Comment> = notes
            .as_array()
            .into_iter()
            .flatten()
            .map(|raw| strip_url_fields(raw.clone()))
            .filter_map(|raw| note_to_comment(&raw, comment_kind))
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    async fn comment(&self, key: &TaskKey, body: &str) -> Result<()> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/projects/{project_id}/{kind}/{iid}/notes"),
            )
            .json(&json!({ "body": body })),
        )
        .await
        .map(|_| ())
    }

    async fn set_labels(&self, key: &TaskKey, labels: &[String]) -> Result<()> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::PUT,
                &format!("/projects/{project_id}/{kind}/{iid}"),
            )
            .json(&json!({ "labels": labels.join(",") })),
        )
        .await
        .map(|_| ())
    }

    async fn add_label(&self, key: &TaskKey, label: &str) -> Result<()> {
        self.update_labels(key, "add_labels", label).await
    }

    async fn remove_label(&self, key: &TaskKey, label: &str) -> Result<()> {
        self.update_labels(key, "remove_labels", label).await
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>> {
        let project_id = Self::project_id(repo)?;
        let branches = self
            .execute(
                self.request(
                    reqwest::Method::GET,
                    &format!("/projects/{project_id}/repository/branches"),
                )
                .query(&[("per_page", "100")]),
            )
            .await?;
        Ok(branches
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|b| b.get("name").and_then(|v| v.as_str()))
            .map(ToString::to_string)
            .collect())
    }

    async fn create_branch(&self, repo: &RepoRef, name: &str, from_ref: &str) -> Result<()> {
        let project_id = Self::project_id(repo)?;
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/projects/{project_id}/repository/branches"),
            )
            .query(&[("branch", name), ("ref", from_ref)]),
        )
        .await
        .map(|_| ())
    }

    async fn create_seed_commit(&self, repo: &RepoRef, branch: &str, message: &str) -> Result<()> {
        let project_id = Self::project_id(repo)?;
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/projects/{project_id}/repository/commits"),
            )
            .json(&json!({
                "branch": branch,
                "commit_message": message,
                "actions": [],
            })),
        )
        .await
        .map(|_| ())
    }

    async fn open_change_request(
        &self,
        repo: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<ChangeRequest> {
        let project_id = Self::project_id(repo)?;
        // GitLab marks drafts through the title prefix.
        let title = if draft {
            format!("Draft: {title}")
        } else {
            title.to_string()
        };
        let created = self
            .execute(
                self.request(
                    reqwest::Method::POST,
                    &format!("/projects/{project_id}/merge_requests"),
                )
                .json(&json!({
                    "source_branch": head,
                    "target_branch": base,
                    "title": title,
                    "description": body,
                })),
            )
            .await?;
        let number = created
            .get("iid")
            .and_then(Value::as_u64)
            .ok_or_else(|| AgentError::Workflow("merge request response had no iid".into()))?;
        let url = created
            .get("web_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ChangeRequest { number, url })
    }

    async fn update_change_request(
        &self,
        key: &TaskKey,
        body: Option<&str>,
        labels: Option<&[String]>,
        assignees: Option<&[String]>,
    ) -> Result<()> {
        let (project_id, kind, iid) = Self::item_path(key)?;
        let mut update = serde_json::Map::new();
        if let Some(body) = body {
            update.insert("description".to_string(), json!(body));
        }
        if let Some(labels) = labels {
            update.insert("add_labels".to_string(), json!(labels.join(",")));
        }
        if let Some(assignees) = assignees {
            let mut ids = Vec::new();
            for username in assignees {
                if let Some(id) = self.resolve_user_id(username).await? {
                    ids.push(id);
                }
            }
            update.insert("assignee_ids".to_string(), json!(ids));
        }
        if update.is_empty() {
            return Ok(());
        }

        self.execute(
            self.request(
                reqwest::Method::PUT,
                &format!("/projects/{project_id}/{kind}/{iid}"),
            )
            .json(&Value::Object(update)),
        )
        .await
        .map(|_| ())
    }

    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()> {
        let project_id = Self::project_id(repo)?;
        self.execute(self.request(
            reqwest::Method::DELETE,
            &format!("/projects/{project_id}/repository/branches/{name}"),
        ))
        .await
        .map(|_| ())
    }

    async fn resolve_user_id(&self, username: &str) -> Result<Option<u64>> {
        let users = self
            .execute(
                self.request(reqwest::Method::GET, "/users")
                    .query(&[("username", username)]),
            )
            .await?;
        Ok(users
            .as_array()
            .and_then(|list| list.first())
            .and_then(|u| u.get("id"))
            .and_then(Value::as_u64))
    }
}
