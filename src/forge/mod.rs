//! Forge adapters: one capability set, two implementations.
//!
//! Everything the core needs from a forge is behind [`ForgeClient`]; the
//! GitHub and GitLab adapters normalize the REST differences (label shapes,
//! comment threads vs. notes, empty-commit support) behind it.

pub mod github;
pub mod gitlab;

pub use github::GitHubForge;
pub use gitlab::GitLabForge;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::task::{Comment, LabelNames, Platform, TaskKey};

/// Default bound on any single forge REST call.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bounded attempt count for transient transport failures.
pub const MAX_REQUEST_RETRIES: u32 = 5;

/// Repository identity, forge-specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoRef {
    GitHub { owner: String, repo: String },
    GitLab { project_id: u64 },
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitHub { owner, repo } => write!(f, "{owner}/{repo}"),
            Self::GitLab { project_id } => write!(f, "project {project_id}"),
        }
    }
}

/// Open/closed filter for listing calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Open,
    Closed,
}

/// A freshly opened change-request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    pub number: u64,
    pub url: String,
}

/// The forge capability set consumed by the core. All calls use a bounded
/// request timeout and surface transport failures as retriable errors.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// List open issues and change-requests carrying `label`, paired with
    /// their canonical keys.
    async fn list_items_with_label(
        &self,
        repo: &RepoRef,
        label: &str,
        state: ItemState,
    ) -> Result<Vec<(TaskKey, Value)>>;

    /// Fetch the raw item for a key (fresh snapshot, not the enqueued one).
    async fn get_item(&self, key: &TaskKey) -> Result<Value>;

    /// All comments on the item in chronological order, review-thread and
    /// timeline comments merged, URL-valued fields stripped.
    async fn get_comments(&self, key: &TaskKey) -> Result<Vec<Comment>>;

    async fn comment(&self, key: &TaskKey, body: &str) -> Result<()>;

    async fn set_labels(&self, key: &TaskKey, labels: &[String]) -> Result<()>;
    async fn add_label(&self, key: &TaskKey, label: &str) -> Result<()>;
    async fn remove_label(&self, key: &TaskKey, label: &str) -> Result<()>;

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>>;
    async fn create_branch(&self, repo: &RepoRef, name: &str, from_ref: &str) -> Result<()>;

    /// Seed a fresh branch with an initial commit. GitHub has no empty-commit
    /// API, so the adapter writes a `.gitkeep` marker; GitLab commits an
    /// empty action list natively.
    async fn create_seed_commit(&self, repo: &RepoRef, branch: &str, message: &str) -> Result<()>;

    async fn open_change_request(
        &self,
        repo: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
        draft: bool,
    ) -> Result<ChangeRequest>;

    async fn update_change_request(
        &self,
        key: &TaskKey,
        body: Option<&str>,
        labels: Option<&[String]>,
        assignees: Option<&[String]>,
    ) -> Result<()>;

    async fn delete_branch(&self, repo: &RepoRef, name: &str) -> Result<()>;

    /// Username to numeric user id. Only the self-hosted forge needs this
    /// for assignment; GitHub returns `None`.
    async fn resolve_user_id(&self, username: &str) -> Result<Option<u64>>;
}

/// One configured forge as the producer and consumer see it: the adapter
/// plus the repository, label names, and bot identity it applies to.
pub struct ForgeTarget {
    pub client: Arc<dyn ForgeClient>,
    pub repo: RepoRef,
    pub labels: LabelNames,
    pub bot_name: Option<String>,
}

/// Recursively drop object entries whose value is a bare URL string. Keeps
/// comment payloads small before they reach the LLM context.
pub fn strip_url_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !matches!(v.as_str(), Some(s) if is_url(s)))
                .map(|(k, v)| (k, strip_url_fields(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_url_fields).collect()),
        other => other,
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_url_fields_removes_nested_urls() {
        let value = json!({
            "id": 1,
            "html_url": "https://example.test/x",
            "user": {"login": "alice", "avatar_url": "https://example.test/a.png"},
            "items": [{"url": "http://example.test", "kept": "not a url"}]
        });
        let stripped = strip_url_fields(value);
        assert_eq!(stripped["id"], 1);
        assert!(stripped.get("html_url").is_none());
        assert_eq!(stripped["user"]["login"], "alice");
        assert!(stripped["user"].get("avatar_url").is_none());
        assert!(stripped["items"][0].get("url").is_none());
        assert_eq!(stripped["items"][0]["kept"], "not a url");
    }
}
