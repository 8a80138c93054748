//! Branch naming for issue conversion.
//!
//! A short LLM call proposes a name; the validator then enforces the naming
//! rules regardless of what came back: lowercase `[a-z0-9/-]`, an allowed
//! prefix, the bot name and issue number embedded, length ≤ 50, no reserved
//! names, and a numeric suffix on collision.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::convert::IssueInfo;
use crate::error::{AgentError, Result};
use crate::llm::{ChatMessage, LlmClient};
use crate::log_warn;

pub const MAX_BRANCH_NAME_LENGTH: usize = 50;
pub const RESERVED_BRANCH_NAMES: [&str; 5] = ["main", "master", "develop", "release", "hotfix"];
pub const ALLOWED_PREFIXES: [&str; 6] =
    ["feature/", "fix/", "docs/", "refactor/", "test/", "task/"];
const MAX_COLLISION_SUFFIX: u32 = 5;

const NAMING_SYSTEM_PROMPT: &str = "\
You are a branch name generator for Git repositories. Analyze the issue \
content and generate an appropriate branch name.

Branch naming rules:
1. Use one of these prefixes based on issue type: feature/ fix/ docs/ \
refactor/ test/ task/
2. MUST include the bot name and issue number: {prefix}{bot_name}-{issue_number}-{description}
3. Use only lowercase letters, numbers, and hyphens
4. Maximum length is 50 characters

Output format: a JSON object with \"branch_name\" and \"reasoning\" fields.";

static DISALLOWED_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9/-]").expect("valid regex"));
static REPEATED_HYPHENS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("valid regex"));
static REPEATED_SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"/+").expect("valid regex"));

pub struct BranchNameGenerator<'a> {
    llm: &'a LlmClient,
    bot_name: String,
}

impl<'a> BranchNameGenerator<'a> {
    pub fn new(llm: &'a LlmClient, bot_name: &str) -> Self {
        let bot_name = sanitize_for_branch(bot_name);
        let bot_name = if bot_name.is_empty() {
            "codingagent".to_string()
        } else {
            bot_name
        };
        Self { llm, bot_name }
    }

    /// Propose and validate a branch name for the issue. LLM failure falls
    /// back to a deterministic name; collision-suffix exhaustion fails.
    pub async fn generate(&self, issue: &IssueInfo, existing_branches: &[String]) -> Result<String> {
        let proposed = match self.request_name(issue, existing_branches).await {
            Ok(name) => name,
            Err(e) => {
                log_warn!("LLM branch naming failed, using fallback: {e}");
                fallback_name(&self.bot_name, issue.number)
            }
        };
        validate_branch_name(&proposed, &self.bot_name, issue.number, existing_branches)
    }

    async fn request_name(&self, issue: &IssueInfo, existing: &[String]) -> Result<String> {
        let labels = if issue.labels.is_empty() {
            "None".to_string()
        } else {
            issue.labels.join(", ")
        };
        let existing_preview = if existing.is_empty() {
            "None".to_string()
        } else {
            existing
                .iter()
                .take(20)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let body_preview: String = issue.body.chars().take(500).collect();

        let messages = [
            ChatMessage::system(NAMING_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Generate a branch name for the following issue:\n\n\
                 Bot Name: {}\n\
                 Issue Number: {}\n\
                 Issue Title: {}\n\
                 Issue Body: {body_preview}\n\
                 Labels: {labels}\n\
                 Repository: {}\n\
                 Existing Branches: {existing_preview}\n\n\
                 Please generate an appropriate branch name following the naming rules.",
                self.bot_name, issue.number, issue.title, issue.repository
            )),
        ];
        let (reply, _) = self.llm.complete(&messages).await?;

        if let Some(json) = crate::dialogue::extract_first_json(&reply) {
            if let Some(name) = json.get("branch_name").and_then(Value::as_str) {
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }
        // Not JSON: accept a bare prefixed name on its own line.
        for line in reply.lines() {
            let line = line.trim();
            if line.contains('/') && !line.starts_with('#') {
                return Ok(line.to_string());
            }
        }
        Err(AgentError::Parse)
    }
}

pub fn fallback_name(bot_name: &str, issue_number: u64) -> String {
    format!("task/{bot_name}-{issue_number}-auto-generated")
}

/// Normalize text into branch-safe form: lowercase, `[a-z0-9/-]` only, no
/// repeated or trailing separators.
pub fn sanitize_for_branch(text: &str) -> String {
    let lowered = text.to_lowercase();
    let replaced = DISALLOWED_CHARS.replace_all(&lowered, "-");
    let collapsed = REPEATED_HYPHENS.replace_all(&replaced, "-");
    let collapsed = REPEATED_SLASHES.replace_all(&collapsed, "/");
    collapsed
        .trim_matches('-')
        .trim_end_matches('/')
        .to_string()
}

/// Enforce every naming rule on a proposed branch name, repairing what can
/// be repaired and failing only on collision-suffix exhaustion.
pub fn validate_branch_name(
    proposed: &str,
    bot_name: &str,
    issue_number: u64,
    existing_branches: &[String],
) -> Result<String> {
    let mut name = sanitize_for_branch(proposed);

    if !ALLOWED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        name = format!("task/{name}");
    }

    // The bot name and issue number must both appear after the prefix.
    let number_token = issue_number.to_string();
    let lower = name.to_lowercase();
    if !lower.contains(&bot_name.to_lowercase()) || !contains_number_token(&lower, &number_token) {
        let (prefix, rest) = match name.split_once('/') {
            Some((prefix, rest)) => (format!("{prefix}/"), rest.to_string()),
            None => ("task/".to_string(), name.clone()),
        };
        name = sanitize_for_branch(&format!("{prefix}{bot_name}-{number_token}-{rest}"));
    }

    if name.len() > MAX_BRANCH_NAME_LENGTH {
        name = name[..MAX_BRANCH_NAME_LENGTH]
            .trim_end_matches('-')
            .to_string();
    }

    let base = name.rsplit('/').next().unwrap_or(&name);
    if RESERVED_BRANCH_NAMES.contains(&base) {
        name = fallback_name(bot_name, issue_number);
    }

    // Collision handling: numeric suffix -2 … -5, then give up.
    if !existing_branches.iter().any(|b| b == &name) {
        return Ok(name);
    }
    let original = name.clone();
    for suffix in 2..=MAX_COLLISION_SUFFIX {
        let base = &original[..original.len().min(MAX_BRANCH_NAME_LENGTH - 3)];
        let candidate = format!("{}-{suffix}", base.trim_end_matches('-'));
        if !existing_branches.iter().any(|b| b == &candidate) {
            return Ok(candidate);
        }
    }
    Err(AgentError::Workflow(format!(
        "no free branch name after {MAX_COLLISION_SUFFIX} suffix attempts for '{original}'"
    )))
}

fn contains_number_token(name: &str, number: &str) -> bool {
    name.split(|c: char| !c.is_ascii_digit())
        .any(|token| token == number)
}
