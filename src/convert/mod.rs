//! Issue → change-request conversion.
//!
//! A small transactional workflow: branch create → seed commit →
//! change-request open → content transfer → label handoff, with branch
//! cleanup compensating failures in the middle steps. Once the
//! change-request exists it is a durable user-visible artifact, so later
//! step failures only log warnings.

pub mod branch;
pub mod transfer;

pub use branch::BranchNameGenerator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::forge::RepoRef;
use crate::llm::LlmClient;
use crate::task::{Task, TaskKey};
use crate::{log_info, log_warn};

/// Converter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Open the change-request as a draft.
    #[serde(default = "default_true")]
    pub auto_draft: bool,
    /// Skip bot comments when transferring the issue transcript.
    #[serde(default = "default_true")]
    pub exclude_bot_comments: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_draft: true,
            exclude_bot_comments: true,
        }
    }
}

impl ConversionConfig {
    /// `ISSUE_TO_MR_ENABLED` overrides the configured toggle.
    pub fn apply_env_override(&mut self) {
        if let Ok(value) = std::env::var("ISSUE_TO_MR_ENABLED") {
            self.enabled = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }
}

/// Outcome of one conversion attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionResult {
    pub success: bool,
    pub cr_number: Option<u64>,
    pub cr_url: Option<String>,
    pub branch_name: Option<String>,
    pub error: Option<String>,
}

impl ConversionResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Issue metadata collected before the workflow starts.
#[derive(Debug, Clone)]
pub struct IssueInfo {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub labels: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub repository: String,
}

pub struct IssueConverter<'a> {
    task: &'a Task,
    llm: &'a LlmClient,
    config: &'a ConversionConfig,
    bot_name: String,
}

impl<'a> IssueConverter<'a> {
    pub fn new(
        task: &'a Task,
        llm: &'a LlmClient,
        config: &'a ConversionConfig,
        bot_name: String,
    ) -> Self {
        Self {
            task,
            llm,
            config,
            bot_name,
        }
    }

    /// Run the conversion workflow. Never returns `Err`: every failure mode
    /// folds into a `ConversionResult` so the caller decides what to do
    /// next.
    pub async fn convert(&self) -> ConversionResult {
        if !self.config.enabled {
            return ConversionResult::failure("issue-to-change-request conversion is disabled");
        }

        let issue = self.collect_issue_info();
        let repo = self.task.key().repo_ref();
        log_info!("converting issue #{} to a change request", issue.number);

        // Branch name, LLM-proposed with a deterministic fallback.
        let existing = match self.task.forge().list_branches(&repo).await {
            Ok(branches) => branches,
            Err(e) => {
                log_warn!("branch listing failed: {e}");
                Vec::new()
            }
        };
        let generator = BranchNameGenerator::new(self.llm, &self.bot_name);
        let branch_name = match generator.generate(&issue, &existing).await {
            Ok(name) => name,
            Err(e) => return ConversionResult::failure(format!("branch naming failed: {e}")),
        };
        log_info!("generated branch name: {branch_name}");

        if let Err(e) = self
            .task
            .forge()
            .create_branch(&repo, &branch_name, "main")
            .await
        {
            return ConversionResult::failure(format!("failed to create branch: {e}"));
        }

        let seed_message = format!("chore: initialize branch for issue #{}", issue.number);
        if let Err(e) = self
            .task
            .forge()
            .create_seed_commit(&repo, &branch_name, &seed_message)
            .await
        {
            self.cleanup_branch(&repo, &branch_name).await;
            return ConversionResult::failure(format!("failed to create seed commit: {e}"));
        }

        let placeholder = format!(
            "This change request was automatically created from issue #{}.",
            issue.number
        );
        let cr = match self
            .task
            .forge()
            .open_change_request(
                &repo,
                &branch_name,
                "main",
                &issue.title,
                &placeholder,
                self.config.auto_draft,
            )
            .await
        {
            Ok(cr) => cr,
            Err(e) => {
                self.cleanup_branch(&repo, &branch_name).await;
                return ConversionResult::failure(format!("failed to open change request: {e}"));
            }
        };

        let cr_key = self.change_request_key(&cr.number);

        // Content transfer: a failure here still tears the branch+CR state
        // down to just the branch, since the CR body stays the placeholder.
        let comments = match self.task.get_comments().await {
            Ok(comments) => comments,
            Err(e) => {
                log_warn!("comment transfer fetch failed: {e}");
                Vec::new()
            }
        };
        let cr_body = transfer::format_change_request_body(
            &issue,
            &comments,
            self.config.exclude_bot_comments,
            &self.bot_name,
        );
        if let Err(e) = self
            .task
            .forge()
            .update_change_request(&cr_key, Some(&cr_body), None, None)
            .await
        {
            self.cleanup_branch(&repo, &branch_name).await;
            return ConversionResult::failure(format!("failed to transfer issue content: {e}"));
        }

        // From here on the change request is a durable user-visible
        // artifact; failures are warnings, not rollbacks.
        self.setup_auto_pickup(&cr_key).await;
        self.notify_source_issue(cr.number, &branch_name, &cr.url)
            .await;
        self.hand_off_source_labels().await;

        log_info!(
            "issue #{} converted to change request #{}",
            issue.number,
            cr.number
        );
        ConversionResult {
            success: true,
            cr_number: Some(cr.number),
            cr_url: Some(cr.url),
            branch_name: Some(branch_name),
            error: None,
        }
    }

    fn collect_issue_info(&self) -> IssueInfo {
        let key = self.task.key();
        IssueInfo {
            number: key.number(),
            title: self.task.title.clone(),
            body: self.task.body.clone(),
            author: if self.task.author.is_empty() {
                "unknown".to_string()
            } else {
                self.task.author.clone()
            },
            labels: self.task.labels.clone(),
            created_at: self.task.created_at,
            repository: key.repo_ref().to_string(),
        }
    }

    fn change_request_key(&self, number: &u64) -> TaskKey {
        match self.task.key() {
            TaskKey::GitHubIssue { owner, repo, .. }
            | TaskKey::GitHubPullRequest { owner, repo, .. } => TaskKey::GitHubPullRequest {
                owner: owner.clone(),
                repo: repo.clone(),
                number: *number,
            },
            TaskKey::GitLabIssue { project_id, .. }
            | TaskKey::GitLabMergeRequest { project_id, .. } => TaskKey::GitLabMergeRequest {
                project_id: *project_id,
                iid: *number,
            },
        }
    }

    /// Label + assign the new change request so a later poll picks it up.
    async fn setup_auto_pickup(&self, cr_key: &TaskKey) {
        let labels = vec![self.task.label_names().bot.clone()];
        // GitLab assignment needs the username→id lookup; the adapter
        // performs it inside update_change_request. Without a bot identity
        // only the label is applied.
        let assignees = if self.bot_name.is_empty() {
            None
        } else {
            Some(vec![self.bot_name.clone()])
        };
        if let Err(e) = self
            .task
            .forge()
            .update_change_request(cr_key, None, Some(&labels), assignees.as_deref())
            .await
        {
            log_warn!("auto-pickup setup failed: {e}");
        }
    }

    async fn notify_source_issue(&self, cr_number: u64, branch_name: &str, cr_url: &str) {
        let url = if cr_url.is_empty() { "N/A" } else { cr_url };
        let body = format!(
            "## 🚀 Change request created\n\n\
             Based on this issue, the following change request was created:\n\n\
             - **Change request**: #{cr_number}\n\
             - **Branch**: `{branch_name}`\n\
             - **Link**: {url}\n\n\
             Further work continues on the change request."
        );
        if let Err(e) = self.task.comment(&body).await {
            log_warn!("source-issue report failed: {e}");
        }
    }

    async fn hand_off_source_labels(&self) {
        let names = self.task.label_names().clone();
        for label in [&names.bot, &names.processing] {
            if let Err(e) = self.task.remove_label(label).await {
                log_warn!("label removal failed for '{label}': {e}");
            }
        }
        if let Err(e) = self.task.add_label(&names.done).await {
            log_warn!("done-label add failed: {e}");
        }
    }

    async fn cleanup_branch(&self, repo: &RepoRef, branch_name: &str) {
        if let Err(e) = self.task.forge().delete_branch(repo, branch_name).await {
            log_warn!("branch cleanup failed for '{branch_name}': {e}");
        }
    }
}

/// Used by the consumer to decide whether a converter run applies.
pub fn conversion_applies(key: &TaskKey, config: &ConversionConfig) -> bool {
    config.enabled && key.is_issue()
}
