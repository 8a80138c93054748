//! GitHub adapter for the forge capability set.
//!
//! Labels on pull requests go through the issues API (the pulls API does not
//! carry them), review comments are merged with timeline comments by
//! timestamp, and seed commits write a `.gitkeep` marker because the contents
//! API cannot create an empty commit.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::forge::{
    strip_url_fields, ChangeRequest, ForgeClient, ItemState, RepoRef, DEFAULT_REQUEST_TIMEOUT_SECS,
    MAX_REQUEST_RETRIES,
};
use crate::log_debug;
use crate::task::{Comment, CommentKind, Platform, TaskKey};

const DEFAULT_API_URL: &str = "https://api.github.com";

pub struct GitHubForge {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubForge {
    pub fn new(token: String, api_url: Option<String>) -> Result<Self> {
        if token.is_empty() {
            return Err(AgentError::Config(
                "GITHUB_PERSONAL_ACCESS_TOKEN is not set".to_string(),
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
        let token = std::env::var("GITHUB_PERSONAL_ACCESS_TOKEN").unwrap_or_default();
        Self::new(token, None)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
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
            log_debug!("retrying GitHub request ({attempt}/{MAX_REQUEST_RETRIES}): {last_error}");
        }
        Err(last_error)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.execute(self.request(reqwest::Method::GET, path).query(query))
            .await
    }

    fn issue_path(key: &TaskKey) -> Result<(String, String, u64)> {
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
            } => Ok((owner.clone(), repo.clone(), *number)),
            _ => Err(AgentError::Config(format!("not a GitHub task key: {key}"))),
        }
    }

    fn repo_path(repo: &RepoRef) -> Result<(String, String)> {
        match repo {
            RepoRef::GitHub { owner, repo } => Ok((owner.clone(), repo.clone())),
            RepoRef::GitLab { .. } => Err(AgentError::Config(
                "GitLab repo ref passed to the GitHub adapter".to_string(),
            )),
        }
    }

    /// Reviews with their thread comments attached, in comment form.
    async fn reviews_with_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<Comment>> {
        let reviews = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}/reviews"),
                &[("per_page", "100".to_string())],
            )
            .await?;
        let thread_comments = self
            .get_json(
                &format!("/repos/{owner}/{repo}/pulls/{number}/comments"),
                &[("per_page", "200".to_string())],
            )
            .await?;

        let mut out = Vec::new();
        for review in reviews.as_array().into_iter().flatten() {
            let review = strip_url_fields(review.clone());
            if let Some(comment) =
                raw_to_comment(&review, CommentKind::InlineReview, "submitted_at")
            {
                out.push(comment);
            }
        }
        for raw in thread_comments.as_array().into_iter().flatten() {
            let raw = strip_url_fields(raw.clone());
            if let Some(comment) = raw_to_comment(&raw, CommentKind::InlineReview, "created_at") {
                out.push(comment);
            }
        }
        Ok(out)
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

fn raw_to_comment(raw: &Value, kind: CommentKind, timestamp_field: &str) -> Option<Comment> {
    let id = raw.get("id")?;
    let id = match id {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let body = raw.get("body").and_then(|v| v.as_str()).unwrap_or_default();
    let author = raw
        .get("user")
        .and_then(|u| u.get("login"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let created_at = raw
        .get(timestamp_field)
        .or_else(|| raw.get("created_at"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())?;
    if body.is_empty() {
        return None;
    }
    Some(Comment {
        id,
        author: author.to_string(),
        body: body.to_string(),
        created_at,
        kind,
    })
}

#[async_trait]
impl ForgeClient for GitHubForge {
    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    async fn list_items_with_label(
        &self,
        repo: &RepoRef,
        label: &str,
        state: ItemState,
    ) -> Result<Vec<(TaskKey, Value)>> {
        let (owner, repo_name) = Self::repo_path(repo)?;
        let state = match state {
            ItemState::Open => "open",
            ItemState::Closed => "closed",
        };
        // The issues API lists both issues and pull requests; PRs carry a
        // `pull_request` marker object.
        let items = self
            .get_json(
                &format!("/repos/{owner}/{repo_name}/issues"),
                &[
                    ("labels", label.to_string()),
                    ("state", state.to_string()),
                    ("per_page", "100".to_string()),
                ],
            )
            .await?;

        let mut out = Vec::new();
        for item in items.as_array().into_iter().flatten() {
            let Some(number) = item.get("number").and_then(Value::as_u64) else {
                continue;
            };
            let key = if item.get("pull_request").is_some() {
                TaskKey::GitHubPullRequest {
                    owner: owner.clone(),
                    repo: repo_name.clone(),
                    number,
                }
            } else {
                TaskKey::GitHubIssue {
                    owner: owner.clone(),
                    repo: repo_name.clone(),
                    number,
                }
            };
            out.push((key, item.clone()));
        }
        Ok(out)
    }

    async fn get_item(&self, key: &TaskKey) -> Result<Value> {
        let (owner, repo, number) = Self::issue_path(key)?;
        self.get_json(&format!("/repos/{owner}/{repo}/issues/{number}"), &[])
            .await
    }

    async fn get_comments(&self, key: &TaskKey) -> Result<Vec<Comment>> {
        let (owner, repo, number) = Self::issue_path(key)?;

        let mut merged = Vec::new();
        if matches!(key, TaskKey::GitHubPullRequest { .. }) {
            merged.extend(self.reviews_with_comments(&owner, &repo, number).await?);
        }

        let timeline = self
            .get_json(
                &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
                &[("per_page", "200".to_string())],
            )
            .await?;
        for raw in timeline.as_array().into_iter().flatten() {
            let raw = strip_url_fields(raw.clone());
            if let Some(comment) = raw_to_comment(&raw, CommentKind::IssueComment, "created_at") {
                merged.push(comment);
            }
        }

        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(merged)
    }

    async fn comment(&self, key: &TaskKey, body: &str) -> Result<()> {
        let (owner, repo, number) = Self::issue_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
            )
            .json(&json!({ "body": body })),
        )
        .await
        .map(|_| ())
    }

    async fn set_labels(&self, key: &TaskKey, labels: &[String]) -> Result<()> {
        let (owner, repo, number) = Self::issue_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::PUT,
                &format!("/repos/{owner}/{repo}/issues/{number}/labels"),
            )
            .json(&json!({ "labels": labels })),
        )
        .await
        .map(|_| ())
    }

    async fn add_label(&self, key: &TaskKey, label: &str) -> Result<()> {
        let (owner, repo, number) = Self::issue_path(key)?;
        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/issues/{number}/labels"),
            )
            .json(&json!({ "labels": [label] })),
        )
        .await
        .map(|_| ())
    }

    async fn remove_label(&self, key: &TaskKey, label: &str) -> Result<()> {
        let (owner, repo, number) = Self::issue_path(key)?;
        let encoded = urlencode(label);
        let result = self
            .execute(self.request(
                reqwest::Method::DELETE,
                &format!("/repos/{owner}/{repo}/issues/{number}/labels/{encoded}"),
            ))
            .await;
        // Removing an absent label is not an error for our purposes.
        match result {
            Ok(_) => Ok(()),
            Err(AgentError::Api { status: 404, .. }) => {
                log_debug!("label '{label}' already absent on {key}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>> {
        let (owner, repo_name) = Self::repo_path(repo)?;
        let branches = self
            .get_json(
                &format!("/repos/{owner}/{repo_name}/branches"),
                &[("per_page", "100".to_string())],
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
        let (owner, repo_name) = Self::repo_path(repo)?;
        let head = self
            .get_json(
                &format!("/repos/{owner}/{repo_name}/git/ref/heads/{from_ref}"),
                &[],
            )
            .await?;
        let sha = head
            .get("object")
            .and_then(|o| o.get("sha"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Workflow(format!("no sha for ref {from_ref}")))?
            .to_string();

        self.execute(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo_name}/git/refs"),
            )
            .json(&json!({ "ref": format!("refs/heads/{name}"), "sha": sha })),
        )
        .await
        .map(|_| ())
    }

    async fn create_seed_commit(&self, repo: &RepoRef, branch: &str, message: &str) -> Result<()> {
        let (owner, repo_name) = Self::repo_path(repo)?;
        let content = base64::engine::general_purpose::STANDARD.encode("");
        self.execute(
            self.request(
                reqwest::Method::PUT,
                &format!("/repos/{owner}/{repo_name}/contents/.gitkeep"),
            )
            .json(&json!({
                "message": message,
                "content": content,
                "branch": branch,
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
        let (owner, repo_name) = Self::repo_path(repo)?;
        let created = self
            .execute(
                self.request(
                    reqwest::Method::POST,
                    &format!("/repos/{owner}/{repo_name}/pulls"),
                )
                .json(&json!({
                    "title": title,
                    "head": head,
                    "base": base,
                    "body": body,
                    "draft": draft,
                })),
            )
            .await?;
        let number = created
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| AgentError::Workflow("pull request response had no number".into()))?;
        let url = created
            .get("html_url")
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
        let (owner, repo, number) = Self::issue_path(key)?;

        if let Some(body) = body {
            self.execute(
                self.request(
                    reqwest::Method::PATCH,
                    &format!("/repos/{owner}/{repo}/pulls/{number}"),
                )
                .json(&json!({ "body": body })),
            )
            .await?;
        }
        if let Some(labels) = labels {
            for label in labels {
                self.add_label(key, label).await?;
            }
        }
        if let Some(assignees) = assignees {
            self.execute(
                self.request(
                    reqwest::Method::POST,
                    &format!("/repos/{owner}/{repo}/issues/{number}/assignees"),
                )
                .json(&json!({ "assignees": assignees })),
            )
            .await?;
        }
        Ok(())
    }

    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()> {
        let (owner, repo_name) = Self::repo_path(repo)?;
        self.execute(self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{owner}/{repo_name}/git/refs/heads/{name}"),
        ))
        .await
        .map(|_| ())
    }

    async fn resolve_user_id(&self, _username: &str) -> Result<Option<u64>> {
        // Assignment on GitHub goes by login, not numeric id.
        Ok(None)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
