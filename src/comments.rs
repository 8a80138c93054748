//! Mid-run comment detection.
//!
//! Detects human comments added to an item while its task is in flight and
//! injects them into the live LLM session between dialogue turns. The
//! observed-ID set only ever grows during a run and survives pause/resume
//! through the checkpoint.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::LlmSession;
use crate::log_debug;
use crate::log_warn;
use crate::task::{Comment, Task};

/// Serialized watcher state, round-tripped through the checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentWatcherState {
    pub observed_ids: Vec<String>,
    pub last_check_time: Option<DateTime<Utc>>,
}

pub struct CommentWatcher {
    enabled: bool,
    bot_username: Option<String>,
    observed_ids: HashSet<String>,
    last_check_time: Option<DateTime<Utc>>,
}

impl CommentWatcher {
    /// Detection is active only when a bot username is configured for the
    /// task's forge; without one every human/bot distinction is guesswork,
    /// so the watcher becomes a no-op.
    pub fn new(bot_username: Option<String>) -> Self {
        let enabled = bot_username.as_deref().is_some_and(|name| !name.is_empty());
        if !enabled {
            log_warn!("no bot username configured; comment detection disabled");
        }
        Self {
            enabled,
            bot_username,
            observed_ids: HashSet::new(),
            last_check_time: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn observed_ids(&self) -> &HashSet<String> {
        &self.observed_ids
    }

    /// Snapshot the current comment list so everything present at task start
    /// counts as already seen. Fetch failures leave the watcher empty and
    /// the run continues.
    pub async fn initialize(&mut self, task: &Task) {
        if !self.enabled {
            return;
        }
        match task.get_comments().await {
            Ok(comments) => {
                self.observed_ids = comments.into_iter().map(|c| c.id).collect();
                self.last_check_time = Some(Utc::now());
                log_debug!(
                    "comment watcher initialized with {} comments",
                    self.observed_ids.len()
                );
            }
            Err(e) => {
                log_warn!("comment snapshot failed: {e}");
            }
        }
    }

    /// Re-fetch and return every unseen non-bot comment, then fold all
    /// current IDs into the observed set. Fetch failures return an empty
    /// list so the dialogue keeps going.
    pub async fn check_for_new_comments(&mut self, task: &Task) -> Vec<Comment> {
        if !self.enabled {
            return Vec::new();
        }
        let current = match task.get_comments().await {
            Ok(comments) => comments,
            Err(e) => {
                log_warn!("comment fetch failed: {e} (task {})", task.descriptor.uuid);
                return Vec::new();
            }
        };

        let mut fresh = Vec::new();
        for comment in &current {
            if !self.observed_ids.contains(&comment.id) && !self.is_bot_comment(comment) {
                fresh.push(comment.clone());
            }
        }
        self.observed_ids
            .extend(current.into_iter().map(|c| c.id));
        self.last_check_time = Some(Utc::now());

        if !fresh.is_empty() {
            log_debug!(
                "{} new comments detected (task {})",
                fresh.len(),
                task.descriptor.uuid
            );
        }
        fresh
    }

    fn is_bot_comment(&self, comment: &Comment) -> bool {
        self.bot_username
            .as_deref()
            .is_some_and(|bot| comment.author == bot)
    }

    /// Render detected comments for the LLM: a single comment gets the short
    /// form, several get a numbered list.
    pub fn format_block(comments: &[Comment]) -> String {
        match comments {
            [] => String::new(),
            [only] => format!("[New Comment from @{}]:\n{}", only.author, only.body),
            many => {
                let mut lines = vec!["[New Comments Detected]:".to_string(), String::new()];
                for (i, comment) in many.iter().enumerate() {
                    lines.push(format!(
                        "Comment {} from @{} ({}):",
                        i + 1,
                        comment.author,
                        comment.created_at.to_rfc3339()
                    ));
                    lines.push(comment.body.clone());
                    lines.push(String::new());
                }
                lines.join("\n")
            }
        }
    }

    /// Push the formatted block as a user message on the live session.
    pub fn inject(&self, session: &mut LlmSession, comments: &[Comment]) {
        if comments.is_empty() {
            return;
        }
        session.send_user(Self::format_block(comments));
        log_debug!("{} new comments injected into context", comments.len());
    }

    pub fn state(&self) -> CommentWatcherState {
        let mut observed_ids: Vec<String> = self.observed_ids.iter().cloned().collect();
        observed_ids.sort();
        CommentWatcherState {
            observed_ids,
            last_check_time: self.last_check_time,
        }
    }

    /// Restore from a checkpointed state. An empty state (the shape a
    /// malformed checkpoint decodes to) falls back to a fresh snapshot.
    pub async fn restore_state(&mut self, state: CommentWatcherState, task: &Task) {
        if !self.enabled {
            return;
        }
        if state.observed_ids.is_empty() && state.last_check_time.is_none() {
            log_warn!("empty watcher state; re-initializing");
            self.initialize(task).await;
            return;
        }
        self.observed_ids = state.observed_ids.into_iter().collect();
        self.last_check_time = state.last_check_time;
        log_debug!(
            "comment watcher restored with {} observed IDs",
            self.observed_ids.len()
        );
    }
}
