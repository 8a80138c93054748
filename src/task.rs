//! Canonical task identity and the in-memory task object.
//!
//! A `TaskKey` uniquely identifies a unit of work across retries and across
//! the webhook and polling ingress paths. The key travels through the queue
//! inside a `TaskDescriptor`; the worker later re-queries the forge and
//! materializes a full `Task` around it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::forge::{ForgeClient, RepoRef};

/// The two supported forge backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    GitHub,
    GitLab,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
        }
    }
}

/// Stable identity of a work item. Used as the dedup key in queue messages
/// and as the checkpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskKey {
    #[serde(rename = "github_issue")]
    GitHubIssue {
        owner: String,
        repo: String,
        number: u64,
    },
    #[serde(rename = "github_pull_request")]
    GitHubPullRequest {
        owner: String,
        repo: String,
        number: u64,
    },
    #[serde(rename = "gitlab_issue")]
    GitLabIssue { project_id: u64, iid: u64 },
    #[serde(rename = "gitlab_merge_request")]
    GitLabMergeRequest { project_id: u64, iid: u64 },
}

impl TaskKey {
    pub fn platform(&self) -> Platform {
        match self {
            Self::GitHubIssue { .. } | Self::GitHubPullRequest { .. } => Platform::GitHub,
            Self::GitLabIssue { .. } | Self::GitLabMergeRequest { .. } => Platform::GitLab,
        }
    }

    /// Issue or change-request number as the forge displays it.
    pub fn number(&self) -> u64 {
        match self {
            Self::GitHubIssue { number, .. } | Self::GitHubPullRequest { number, .. } => *number,
            Self::GitLabIssue { iid, .. } | Self::GitLabMergeRequest { iid, .. } => *iid,
        }
    }

    /// Whether the key names an issue (as opposed to a change-request).
    pub fn is_issue(&self) -> bool {
        matches!(self, Self::GitHubIssue { .. } | Self::GitLabIssue { .. })
    }

    /// Repository identity for branch and change-request operations.
    pub fn repo_ref(&self) -> RepoRef {
        match self {
            Self::GitHubIssue { owner, repo, .. } | Self::GitHubPullRequest { owner, repo, .. } => {
                RepoRef::GitHub {
                    owner: owner.clone(),
                    repo: repo.clone(),
                }
            }
            Self::GitLabIssue { project_id, .. } | Self::GitLabMergeRequest { project_id, .. } => {
                RepoRef::GitLab {
                    project_id: *project_id,
                }
            }
        }
    }

    /// Filesystem-safe identifier, used for checkpoint file names.
    pub fn slug(&self) -> String {
        match self {
            Self::GitHubIssue {
                owner,
                repo,
                number,
            } => format!("github-issue-{owner}-{repo}-{number}"),
            Self::GitHubPullRequest {
                owner,
                repo,
                number,
            } => format!("github-pr-{owner}-{repo}-{number}"),
            Self::GitLabIssue { project_id, iid } => format!("gitlab-issue-{project_id}-{iid}"),
            Self::GitLabMergeRequest { project_id, iid } => format!("gitlab-mr-{project_id}-{iid}"),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitHubIssue {
                owner,
                repo,
                number,
            } => write!(f, "{owner}/{repo}#{number}"),
            Self::GitHubPullRequest {
                owner,
                repo,
                number,
            } => write!(f, "{owner}/{repo}!{number}"),
            Self::GitLabIssue { project_id, iid } => write!(f, "project {project_id}#{iid}"),
            Self::GitLabMergeRequest { project_id, iid } => write!(f, "project {project_id}!{iid}"),
        }
    }
}

/// What flows through the queue. The `uuid` is fresh per enqueue; the key is
/// the dedup handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub uuid: Uuid,
    pub task_key: TaskKey,
    pub user: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskDescriptor {
    pub fn new(task_key: TaskKey, user: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            task_key,
            user,
            enqueued_at: Utc::now(),
        }
    }
}

/// Origin of a comment on a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    InlineReview,
    IssueComment,
}

/// A single comment, normalized across the two forges. IDs are strings to
/// stay platform-agnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub kind: CommentKind,
}

/// The label triple that gates the task lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelNames {
    pub bot: String,
    pub processing: String,
    pub done: String,
}

impl Default for LabelNames {
    fn default() -> Self {
        Self {
            bot: "coding agent".to_string(),
            processing: "coding agent processing".to_string(),
            done: "coding agent done".to_string(),
        }
    }
}

/// Terminal outcome of a task run, from the agent's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed,
}

/// Full task object materialized by a worker from a descriptor plus a fresh
/// forge query. All forge-side effects go through the adapter it carries.
pub struct Task {
    pub descriptor: TaskDescriptor,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub author: String,
    pub created_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
    pub resumed: bool,
    forge: Arc<dyn ForgeClient>,
    label_names: LabelNames,
}

impl Task {
    pub fn new(
        descriptor: TaskDescriptor,
        raw: serde_json::Value,
        forge: Arc<dyn ForgeClient>,
        label_names: LabelNames,
    ) -> Self {
        let title = raw
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let body = raw
            .get("body")
            .or_else(|| raw.get("description"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let labels = extract_label_names(&raw);
        let author = extract_author(&raw);
        let created_at = raw
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());

        Self {
            descriptor,
            title,
            body,
            labels,
            author,
            created_at,
            raw,
            resumed: false,
            forge,
            label_names,
        }
    }

    pub fn key(&self) -> &TaskKey {
        &self.descriptor.task_key
    }

    pub fn label_names(&self) -> &LabelNames {
        &self.label_names
    }

    pub fn forge(&self) -> &Arc<dyn ForgeClient> {
        &self.forge
    }

    pub fn has_bot_label(&self) -> bool {
        self.labels.iter().any(|l| l == &self.label_names.bot)
    }

    pub fn has_processing_label(&self) -> bool {
        self.labels
            .iter()
            .any(|l| l == &self.label_names.processing)
    }

    pub async fn get_comments(&self) -> Result<Vec<Comment>> {
        self.forge.get_comments(self.key()).await
    }

    pub async fn comment(&self, text: &str) -> Result<()> {
        self.forge.comment(self.key(), text).await
    }

    pub async fn add_label(&self, name: &str) -> Result<()> {
        self.forge.add_label(self.key(), name).await
    }

    pub async fn remove_label(&self, name: &str) -> Result<()> {
        self.forge.remove_label(self.key(), name).await
    }

    /// Acquire ownership by applying the processing label. The label is the
    /// distributed lock; the forge serializes the transition.
    pub async fn prepare(&self) -> Result<()> {
        self.add_label(&self.label_names.processing).await
    }

    /// Release the item terminally: bot and processing labels removed, done
    /// label added. Failure is final from the agent's perspective, so both
    /// outcomes converge on the same label state.
    pub async fn finalize(&self, _outcome: TaskOutcome) -> Result<()> {
        self.remove_label(&self.label_names.bot).await?;
        self.remove_label(&self.label_names.processing).await?;
        self.add_label(&self.label_names.done).await
    }
}

/// Label names from either forge's raw item shape: GitHub uses objects with a
/// `name` field, GitLab webhook payloads use `title`, GitLab REST uses plain
/// strings.
pub fn extract_label_names(raw: &serde_json::Value) -> Vec<String> {
    raw.get("labels")
        .and_then(|v| v.as_array())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| {
                    l.as_str()
                        .or_else(|| l.get("name").and_then(|n| n.as_str()))
                        .or_else(|| l.get("title").and_then(|t| t.as_str()))
                        .map(ToString::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_author(raw: &serde_json::Value) -> String {
    raw.get("user")
        .and_then(|u| u.get("login"))
        .and_then(|v| v.as_str())
        .or_else(|| {
            raw.get("author")
                .and_then(|a| a.get("username"))
                .and_then(|v| v.as_str())
        })
        .or_else(|| raw.get("author").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_serializes_with_type_tag() {
        let key = TaskKey::GitHubIssue {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            number: 42,
        };
        let json = serde_json::to_value(&key).expect("serialize");
        assert_eq!(json["type"], "github_issue");
        assert_eq!(json["number"], 42);

        let back: TaskKey = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, key);
    }

    #[test]
    fn task_key_variants_are_disjoint() {
        let issue = TaskKey::GitLabIssue {
            project_id: 7,
            iid: 3,
        };
        let mr = TaskKey::GitLabMergeRequest {
            project_id: 7,
            iid: 3,
        };
        assert_ne!(issue, mr);
        assert_ne!(issue.slug(), mr.slug());
    }

    #[test]
    fn descriptor_uuid_is_fresh_per_enqueue() {
        let key = TaskKey::GitLabIssue {
            project_id: 1,
            iid: 1,
        };
        let a = TaskDescriptor::new(key.clone(), None);
        let b = TaskDescriptor::new(key, None);
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(a.task_key, b.task_key);
    }

    #[test]
    fn label_extraction_handles_all_shapes() {
        let gh = serde_json::json!({"labels": [{"name": "bug"}, {"name": "coding agent"}]});
        assert_eq!(extract_label_names(&gh), vec!["bug", "coding agent"]);

        let gl_hook = serde_json::json!({"labels": [{"title": "coding agent"}]});
        assert_eq!(extract_label_names(&gl_hook), vec!["coding agent"]);

        let gl_rest = serde_json::json!({"labels": ["coding agent"]});
        assert_eq!(extract_label_names(&gl_rest), vec!["coding agent"]);
    }
}
