#[path = "test_utils.rs"]
mod test_utils;

use forgebot::convert::{conversion_applies, ConversionConfig, IssueConverter};
use forgebot::llm::{LlmClient, LlmConfig};
use forgebot::task::TaskKey;
use test_utils::{make_task, MockForge};

fn offline_llm() -> LlmClient {
    // Points at a closed port; every call fails fast, so the converter
    // exercises its deterministic fallback path.
    LlmClient::new(LlmConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        max_retries: 1,
        request_timeout_seconds: 1,
        ..LlmConfig::default()
    })
    .expect("client")
}

#[tokio::test]
async fn conversion_creates_branch_and_hands_off_labels() {
    let forge = MockForge::new();
    forge
        .labels
        .lock()
        .extend(["coding agent".to_string(), "coding agent processing".to_string()]);
    forge.push_comment("1", "alice", "please keep it simple", 0);
    let task = make_task(forge.clone());

    let llm = offline_llm();
    let config = ConversionConfig::default();
    let converter = IssueConverter::new(&task, &llm, &config, "forgebot".to_string());

    let result = converter.convert().await;
    assert!(result.success, "conversion failed: {:?}", result.error);
    assert_eq!(result.cr_number, Some(99));
    assert!(result.cr_url.as_deref().unwrap_or_default().contains("99"));

    // Branch from the LLM fallback path: task/<bot>-<number>-auto-generated.
    let branch = result.branch_name.expect("branch name");
    assert_eq!(branch, "task/forgebot-1-auto-generated");
    assert!(forge.branches.lock().contains(&branch));

    // Label handoff on the source issue.
    let labels = forge.labels.lock().clone();
    assert!(!labels.contains(&"coding agent".to_string()));
    assert!(!labels.contains(&"coding agent processing".to_string()));
    assert!(labels.contains(&"coding agent done".to_string()));

    // Report comment on the source issue links the change request.
    let posted = forge.posted.lock().clone();
    assert!(posted.iter().any(|c| c.contains("#99") && c.contains(&branch)));
}

#[tokio::test]
async fn branch_collision_gets_a_numeric_suffix() {
    let forge = MockForge::new();
    forge
        .branches
        .lock()
        .push("task/forgebot-1-auto-generated".to_string());
    let task = make_task(forge.clone());

    let llm = offline_llm();
    let config = ConversionConfig::default();
    let converter = IssueConverter::new(&task, &llm, &config, "forgebot".to_string());

    let result = converter.convert().await;
    assert!(result.success);
    assert_eq!(
        result.branch_name.as_deref(),
        Some("task/forgebot-1-auto-generated-2")
    );
}

#[tokio::test]
async fn disabled_conversion_reports_failure_without_side_effects() {
    let forge = MockForge::new();
    let task = make_task(forge.clone());

    let llm = offline_llm();
    let config = ConversionConfig {
        enabled: false,
        ..ConversionConfig::default()
    };
    let converter = IssueConverter::new(&task, &llm, &config, "forgebot".to_string());

    let result = converter.convert().await;
    assert!(!result.success);
    assert!(forge.branches.lock().is_empty());
    assert!(forge.posted.lock().is_empty());
}

#[test]
fn conversion_only_applies_to_issues() {
    let config = ConversionConfig::default();
    let issue = TaskKey::GitHubIssue {
        owner: "a".to_string(),
        repo: "b".to_string(),
        number: 1,
    };
    let pr = TaskKey::GitHubPullRequest {
        owner: "a".to_string(),
        repo: "b".to_string(),
        number: 1,
    };
    assert!(conversion_applies(&issue, &config));
    assert!(!conversion_applies(&pr, &config));

    let disabled = ConversionConfig {
        enabled: false,
        ..ConversionConfig::default()
    };
    assert!(!conversion_applies(&issue, &disabled));
}

