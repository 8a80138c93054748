//! The dialogue driver: a bounded state machine whose transitions are driven
//! by LLM replies parsed as JSON.
//!
//! Each turn is one LLM round-trip plus, optionally, one tool call. Between
//! turns the driver consults the comment watcher and the pause signal;
//! pausing writes a checkpoint and leaves the item in `processing` for a
//! later worker to resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::comments::CommentWatcher;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmSession};
use crate::mcp::McpToolClient;
use crate::signals::SignalState;
use crate::task::{Task, TaskKey};
use crate::{log_debug, log_info, log_warn};

/// Conversation length (in messages) beyond which the oldest non-system half
/// is dropped.
const COMPRESSION_THRESHOLD: usize = 80;

const MAX_PARSE_RETRIES: u32 = 5;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous coding agent operating on a code forge. You are given \
an issue or change request and you work on it by calling tools.

Reply with exactly one JSON object per message, in one of these forms:

1. Invoke a tool:
   {\"command\": {\"tool\": \"<tool name>\", \"args\": { ... }}}
2. Finish the task:
   {\"done\": true, \"summary\": \"<what you did>\"}

Any other JSON is treated as a conversational message and posted as a \
comment. Work step by step: inspect the repository before changing it, make \
the smallest change that satisfies the request, and finish with done:true \
once the work is complete.";

pub const DEFAULT_FIRST_USER_PROMPT: &str = "\
Work on the following {item_kind} in {repository}:

Number: #{number}
Title: {title}

{body}";

/// Tuneables for the dialogue loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueSettings {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Cap on a stringified tool result before it enters the context.
    #[serde(default = "default_tool_result_cap")]
    pub tool_result_cap: usize,
}

fn default_max_turns() -> u32 {
    50
}

fn default_tool_result_cap() -> usize {
    8192
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            tool_result_cap: default_tool_result_cap(),
        }
    }
}

/// Dialogue progress, checkpointed at turn boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogueState {
    pub turn_index: u32,
    pub previous_output: Option<String>,
    pub compression_count: u32,
    pub total_tokens: i64,
    pub pending_tool_result: Option<String>,
    pub detected_comment_ids: Vec<String>,
    pub messages: Vec<ChatMessage>,
    pub llm_call_count: u32,
    pub tool_call_count: u32,
}

/// What one parsed LLM reply asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Done { message: String },
    ToolCall { tool: String, args: Value },
    Chat { message: String },
    ParseFailed,
}

/// How a dialogue run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogueEnd {
    Completed,
    Failed { error: String },
    Paused,
}

/// Extract the first parseable JSON object from free-form LLM text.
pub fn extract_first_json(text: &str) -> Option<Value> {
    for (index, ch) in text.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    None
}

/// Classify a raw reply into a turn outcome.
pub fn classify_reply(reply: &str) -> TurnOutcome {
    let Some(json) = extract_first_json(reply) else {
        return TurnOutcome::ParseFailed;
    };

    if json.get("done").and_then(Value::as_bool) == Some(true) {
        return TurnOutcome::Done {
            message: reply.to_string(),
        };
    }
    if let Some(command) = json.get("command") {
        if let Some(tool) = command.get("tool").and_then(|v| v.as_str()) {
            let args = command.get("args").cloned().unwrap_or(Value::Null);
            return TurnOutcome::ToolCall {
                tool: tool.to_string(),
                args,
            };
        }
    }
    TurnOutcome::Chat {
        message: reply.to_string(),
    }
}

/// Truncate a tool result to the configured cap, marking the cut.
pub fn truncate_tool_result(result: &str, cap: usize) -> String {
    if result.len() <= cap {
        return result.to_string();
    }
    let mut end = cap;
    while end > 0 && !result.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated]", &result[..end])
}

/// Inject the repository identity into tool arguments so the LLM never has
/// to supply it.
pub fn inject_repo_args(args: &mut Value, key: &TaskKey) {
    if !args.is_object() {
        *args = Value::Object(serde_json::Map::new());
    }
    let Some(map) = args.as_object_mut() else {
        return;
    };
    match key {
        TaskKey::GitHubIssue { owner, repo, .. } | TaskKey::GitHubPullRequest { owner, repo, .. } => {
            map.entry("owner".to_string())
                .or_insert_with(|| Value::String(owner.clone()));
            map.entry("repo".to_string())
                .or_insert_with(|| Value::String(repo.clone()));
        }
        TaskKey::GitLabIssue { project_id, .. } | TaskKey::GitLabMergeRequest { project_id, .. } => {
            map.entry("project_id".to_string())
                .or_insert_with(|| Value::from(*project_id));
        }
    }
}

/// Render the first user prompt from the task fields.
pub fn render_first_prompt(template: &str, task: &Task) -> String {
    let key = task.key();
    let item_kind = if key.is_issue() {
        "issue"
    } else {
        "change request"
    };
    template
        .replace("{item_kind}", item_kind)
        .replace("{repository}", &key.repo_ref().to_string())
        .replace("{number}", &key.number().to_string())
        .replace("{title}", &task.title)
        .replace("{body}", &task.body)
}

pub struct DialogueDriver<'a> {
    task: &'a Task,
    session: LlmSession,
    mcp: Option<&'a McpToolClient>,
    watcher: CommentWatcher,
    checkpoints: &'a CheckpointStore,
    signals: &'a SignalState,
    settings: DialogueSettings,
    state: DialogueState,
}

impl<'a> DialogueDriver<'a> {
    /// Seed a fresh dialogue or restore one from a checkpoint, depending on
    /// `task.resumed`.
    pub async fn new(
        task: &'a Task,
        mut session: LlmSession,
        mcp: Option<&'a McpToolClient>,
        mut watcher: CommentWatcher,
        checkpoints: &'a CheckpointStore,
        signals: &'a SignalState,
        settings: DialogueSettings,
        system_prompt: &str,
        first_prompt_template: &str,
    ) -> Self {
        let mut state = DialogueState::default();

        let restored = if task.resumed {
            checkpoints.load(task.key())
        } else {
            None
        };
        match restored {
            Some(checkpoint) => {
                state = checkpoint.dialogue;
                session.messages = state.messages.clone();
                session.call_count = state.llm_call_count;
                session.usage.total_tokens = state.total_tokens;
                watcher.restore_state(checkpoint.comments, task).await;
                log_info!(
                    "resuming dialogue for {} at turn {}",
                    task.key(),
                    state.turn_index
                );
            }
            None => {
                session.send_system(system_prompt);
                session.send_user(render_first_prompt(first_prompt_template, task));
                watcher.initialize(task).await;
            }
        }

        Self {
            task,
            session,
            mcp,
            watcher,
            checkpoints,
            signals,
            settings,
            state,
        }
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    /// Run the dialogue to a terminal state or a pause point.
    pub async fn run(&mut self) -> Result<DialogueEnd> {
        let mut parse_failures: u32 = 0;

        loop {
            if self.signals.stop_requested() {
                self.save_checkpoint()?;
                log_info!("dialogue paused for {}", self.task.key());
                return Ok(DialogueEnd::Paused);
            }
            if self.state.turn_index >= self.settings.max_turns {
                let error = format!("turn limit ({}) reached", self.settings.max_turns);
                self.post_error(&error).await;
                return Ok(DialogueEnd::Failed { error });
            }

            let reply = match self.session.complete().await {
                Ok(reply) => reply,
                Err(e) => {
                    let error = format!("LLM call failed after retries: {e}");
                    self.post_error(&error).await;
                    return Ok(DialogueEnd::Failed { error });
                }
            };
            self.state.llm_call_count = self.session.call_count;
            self.state.total_tokens = self.session.usage.total_tokens;
            self.state.pending_tool_result = None;

            match classify_reply(&reply) {
                TurnOutcome::Done { message } => {
                    if let Err(e) = self.task.comment(&message).await {
                        log_warn!("final comment failed: {e}");
                    }
                    log_info!("dialogue for {} finished", self.task.key());
                    return Ok(DialogueEnd::Completed);
                }
                TurnOutcome::ToolCall { tool, mut args } => {
                    inject_repo_args(&mut args, self.task.key());
                    let output = self.dispatch_tool(&tool, args).await;
                    let truncated = truncate_tool_result(&output, self.settings.tool_result_cap);
                    self.state.previous_output = Some(truncated.clone());
                    self.state.pending_tool_result = Some(truncated.clone());
                    self.state.tool_call_count += 1;
                    self.session
                        .send_user(format!("[Tool Result for {tool}]:\n{truncated}"));
                    parse_failures = 0;
                }
                TurnOutcome::Chat { message } => {
                    if let Err(e) = self.task.comment(&message).await {
                        log_warn!("conversational comment failed: {e}");
                    }
                    parse_failures = 0;
                }
                TurnOutcome::ParseFailed => {
                    parse_failures += 1;
                    log_warn!(
                        "no parseable JSON in reply ({parse_failures}/{MAX_PARSE_RETRIES}) for {}",
                        self.task.key()
                    );
                    if let Err(e) = self.task.comment(&reply).await {
                        log_warn!("raw-reply comment failed: {e}");
                    }
                    if parse_failures >= MAX_PARSE_RETRIES {
                        let error = "no parseable JSON after 5 attempts".to_string();
                        self.post_error(&error).await;
                        return Ok(DialogueEnd::Failed { error });
                    }
                    self.session.send_user(
                        "Your reply contained no parseable JSON object. Reply with exactly \
                         one JSON object as instructed.",
                    );
                }
            }

            self.state.turn_index += 1;
            self.maybe_compress();

            // Fresh human comments enter the context before the next turn.
            let fresh = self.watcher.check_for_new_comments(self.task).await;
            if !fresh.is_empty() {
                self.state
                    .detected_comment_ids
                    .extend(fresh.iter().map(|c| c.id.clone()));
                self.watcher.inject(&mut self.session, &fresh);
            }

            self.save_checkpoint()?;
        }
    }

    async fn dispatch_tool(&self, tool: &str, args: Value) -> String {
        let Some(mcp) = self.mcp else {
            return "Error: no tool server is configured".to_string();
        };
        log_debug!("dispatching tool '{tool}' for {}", self.task.key());
        match mcp.call_tool(tool, args).await {
            Ok(value) => value.to_string(),
            // Tool errors go back to the LLM, which is expected to recover.
            Err(e) => format!("Error: {e}"),
        }
    }

    fn maybe_compress(&mut self) {
        if self.session.messages.len() <= COMPRESSION_THRESHOLD {
            return;
        }
        // Keep the system prompt and the recent half of the conversation.
        let keep_from = self.session.messages.len() / 2;
        let mut compressed: Vec<ChatMessage> = self
            .session
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .cloned()
            .collect();
        compressed.extend(
            self.session
                .messages
                .iter()
                .skip(keep_from)
                .filter(|m| m.role != "system")
                .cloned(),
        );
        self.session.messages = compressed;
        self.state.compression_count += 1;
        log_debug!(
            "conversation compressed ({} times so far)",
            self.state.compression_count
        );
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        self.state.messages = self.session.messages.clone();
        self.checkpoints.save(
            self.task.key(),
            &Checkpoint {
                dialogue: self.state.clone(),
                comments: self.watcher.state(),
            },
        )
    }

    async fn post_error(&self, error: &str) {
        if let Err(e) = self.task.comment(&format!("Error: {error}")).await {
            log_warn!("error comment failed: {e}");
        }
    }
}
