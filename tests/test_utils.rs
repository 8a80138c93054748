//! Shared test infrastructure: an in-memory forge double and task builders.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use forgebot::error::{AgentError, Result};
use forgebot::forge::{ChangeRequest, ForgeClient, ItemState, RepoRef};
use forgebot::task::{
    Comment, CommentKind, LabelNames, Platform, Task, TaskDescriptor, TaskKey,
};

/// Forge double backed by in-memory state. Every mutation is observable so
/// tests can assert on label transitions and posted comments.
#[derive(Default)]
pub struct MockForge {
    pub comments: Mutex<Vec<Comment>>,
    pub labels: Mutex<Vec<String>>,
    pub branches: Mutex<Vec<String>>,
    pub posted: Mutex<Vec<String>>,
    pub fail_comment_fetch: Mutex<bool>,
}

impl MockForge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_comment(&self, id: &str, author: &str, body: &str, minute: u32) {
        self.comments.lock().push(Comment {
            id: id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_at: timestamp(minute),
            kind: CommentKind::IssueComment,
        });
    }
}

pub fn timestamp(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0)
        .single()
        .expect("valid timestamp")
}

#[async_trait]
impl ForgeClient for MockForge {
    fn platform(&self) -> Platform {
        Platform::GitHub
    }

    async fn list_items_with_label(
        &self,
        _repo: &RepoRef,
        _label: &str,
        _state: ItemState,
    ) -> Result<Vec<(TaskKey, Value)>> {
        Ok(Vec::new())
    }

    async fn get_item(&self, _key: &TaskKey) -> Result<Value> {
        Ok(json!({
            "title": "Test item",
            "body": "test body",
            "labels": self.labels.lock().iter().map(|l| json!({"name": l})).collect::<Vec<_>>(),
            "user": {"login": "alice"},
        }))
    }

    async fn get_comments(&self, _key: &TaskKey) -> Result<Vec<Comment>> {
        if *self.fail_comment_fetch.lock() {
            return Err(AgentError::Transport("forge unavailable".to_string()));
        }
        Ok(self.comments.lock().clone())
    }

    async fn comment(&self, _key: &TaskKey, body: &str) -> Result<()> {
        self.posted.lock().push(body.to_string());
        Ok(())
    }

    async fn set_labels(&self, _key: &TaskKey, labels: &[String]) -> Result<()> {
        *self.labels.lock() = labels.to_vec();
        Ok(())
    }

    async fn add_label(&self, _key: &TaskKey, label: &str) -> Result<()> {
        let mut labels = self.labels.lock();
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        Ok(())
    }

    async fn remove_label(&self, _key: &TaskKey, label: &str) -> Result<()> {
        self.labels.lock().retain(|l| l != label);
        Ok(())
    }

    async fn list_branches(&self, _repo: &RepoRef) -> Result<Vec<String>> {
        Ok(self.branches.lock().clone())
    }

    async fn create_branch(&self, _repo: &RepoRef, name: &str, _from_ref: &str) -> Result<()> {
        self.branches.lock().push(name.to_string());
        Ok(())
    }

    async fn create_seed_commit(
        &self,
        _repo: &RepoRef,
        _branch: &str,
        _message: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn open_change_request(
        &self,
        _repo: &RepoRef,
        _head: &str,
        _base: &str,
        _title: &str,
        _body: &str,
        _draft: bool,
    ) -> Result<ChangeRequest> {
        Ok(ChangeRequest {
            number: 99,
            url: "https://example.test/pull/99".to_string(),
        })
    }

    async fn update_change_request(
        &self,
        _key: &TaskKey,
        _body: Option<&str>,
        _labels: Option<&[String]>,
        _assignees: Option<&[String]>,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_branch(&self, _repo: &RepoRef, name: &str) -> Result<()> {
        self.branches.lock().retain(|b| b != name);
        Ok(())
    }

    async fn resolve_user_id(&self, _username: &str) -> Result<Option<u64>> {
        Ok(Some(1))
    }
}

pub fn issue_key() -> TaskKey {
    TaskKey::GitHubIssue {
        owner: "acme".to_string(),
        repo: "widgets".to_string(),
        number: 1,
    }
}

pub fn make_task(forge: Arc<MockForge>) -> Task {
    let descriptor = TaskDescriptor::new(issue_key(), Some("alice".to_string()));
    let raw = json!({
        "title": "Create hello_world.py",
        "body": "Add a main that prints hello world",
        "labels": [{"name": "coding agent"}],
        "user": {"login": "alice"},
        "created_at": "2025-06-01T10:00:00Z",
    });
    Task::new(descriptor, raw, forge, LabelNames::default())
}
