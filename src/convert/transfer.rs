//! Issue transcript transfer into the change-request body.

use crate::convert::IssueInfo;
use crate::task::Comment;

/// At most this many of the most recent comments are transferred.
pub const MAX_TRANSFER_COMMENTS: usize = 50;

const COMMON_BOT_PATTERNS: [&str; 4] = ["bot", "automation", "ci-", "github-actions"];

/// Render the full change-request body: issue section, comment transcript,
/// and the auto-generation notice.
pub fn format_change_request_body(
    issue: &IssueInfo,
    comments: &[Comment],
    exclude_bot_comments: bool,
    bot_name: &str,
) -> String {
    format!(
        "{}\n{}\n{}",
        format_issue_section(issue),
        format_comments_section(comments, exclude_bot_comments, bot_name),
        format_auto_section(issue.number)
    )
}

fn format_issue_section(issue: &IssueInfo) -> String {
    let created_at = issue
        .created_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    format!(
        "## 📋 Transferred from the source issue\n\n\
         ### Issue information\n\
         - **Issue number**: #{}\n\
         - **Author**: @{}\n\
         - **Created at**: {created_at}\n\n\
         ### Issue body\n\
         {}\n\n\
         ---",
        issue.number, issue.author, issue.body
    )
}

fn format_comments_section(
    comments: &[Comment],
    exclude_bot_comments: bool,
    bot_name: &str,
) -> String {
    if comments.is_empty() {
        return "## 💬 Issue comments\n\nNo comments.\n\n---".to_string();
    }

    let start = comments.len().saturating_sub(MAX_TRANSFER_COMMENTS);
    let recent = &comments[start..];

    let mut lines = vec!["## 💬 Issue comments\n".to_string()];
    for (i, comment) in recent.iter().enumerate() {
        if exclude_bot_comments && is_bot_author(&comment.author, bot_name) {
            continue;
        }
        lines.push(format!("### Comment {}", i + 1));
        lines.push(format!("- **Author**: @{}", comment.author));
        lines.push(format!(
            "- **Posted at**: {}",
            comment.created_at.to_rfc3339()
        ));
        lines.push(String::new());
        lines.push(comment.body.clone());
        lines.push(String::new());
    }
    lines.push("---".to_string());
    lines.join("\n")
}

fn format_auto_section(issue_number: u64) -> String {
    format!(
        "## 🤖 Auto-generated\n\
         This change request was automatically created from issue #{issue_number}."
    )
}

fn is_bot_author(author: &str, bot_name: &str) -> bool {
    let author = author.to_lowercase();
    if !bot_name.is_empty() && author == bot_name.to_lowercase() {
        return true;
    }
    COMMON_BOT_PATTERNS.iter().any(|p| author.contains(p))
}
