use forgebot::convert::branch::{
    fallback_name, sanitize_for_branch, validate_branch_name, ALLOWED_PREFIXES,
    MAX_BRANCH_NAME_LENGTH,
};

fn validate(proposed: &str, existing: &[&str]) -> String {
    let existing: Vec<String> = existing.iter().map(ToString::to_string).collect();
    validate_branch_name(proposed, "bot", 42, &existing).expect("valid branch name")
}

#[test]
fn sanitize_lowercases_and_strips_disallowed_characters() {
    assert_eq!(sanitize_for_branch("Fix Login_Bug!"), "fix-login-bug");
    assert_eq!(sanitize_for_branch("feature//x--y"), "feature/x-y");
    assert_eq!(sanitize_for_branch("-trailing-"), "trailing");
}

#[test]
fn produced_names_always_match_the_naming_rule() {
    let inputs = [
        "feature/bot-42-add-auth",
        "Add User Authentication",
        "fix/LOGIN bug",
        "docs/",
    ];
    for input in inputs {
        let name = validate(input, &[]);
        assert!(
            ALLOWED_PREFIXES.iter().any(|p| name.starts_with(p)),
            "bad prefix in {name}"
        );
        assert!(name.len() <= MAX_BRANCH_NAME_LENGTH, "too long: {name}");
        assert!(name.contains("bot"), "bot name missing from {name}");
        assert!(name.contains("42"), "issue number missing from {name}");
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '/'),
            "bad characters in {name}"
        );
    }
}

#[test]
fn missing_prefix_gets_task_prefix() {
    let name = validate("bot-42-cleanup", &[]);
    assert!(name.starts_with("task/"));
}

#[test]
fn bot_and_number_are_inserted_when_absent() {
    let name = validate("feature/add-authentication", &[]);
    assert!(name.starts_with("feature/"));
    assert!(name.contains("bot-42"));
}

#[test]
fn number_must_match_as_a_full_token() {
    // "420" must not satisfy the issue-number-42 requirement.
    let name = validate("feature/bot-420-auth", &[]);
    assert!(name.contains("bot-42"), "got {name}");
}

#[test]
fn reserved_base_names_fall_back() {
    let name = validate("feature/bot-42/develop", &[]);
    assert_eq!(name, fallback_name("bot", 42));
}

#[test]
fn collision_appends_first_free_suffix() {
    let name = validate("feature/bot-42-add-auth", &["feature/bot-42-add-auth"]);
    assert_eq!(name, "feature/bot-42-add-auth-2");

    let name = validate(
        "feature/bot-42-add-auth",
        &[
            "feature/bot-42-add-auth",
            "feature/bot-42-add-auth-2",
            "feature/bot-42-add-auth-3",
        ],
    );
    assert_eq!(name, "feature/bot-42-add-auth-4");
}

#[test]
fn suffix_exhaustion_fails() {
    let existing: Vec<String> = std::iter::once("feature/bot-42-add-auth".to_string())
        .chain((2..=5).map(|i| format!("feature/bot-42-add-auth-{i}")))
        .collect();
    let result = validate_branch_name("feature/bot-42-add-auth", "bot", 42, &existing);
    assert!(result.is_err());
}

#[test]
fn long_names_are_trimmed_to_the_cap() {
    let long = format!("feature/bot-42-{}", "x".repeat(100));
    let name = validate(&long, &[]);
    assert!(name.len() <= MAX_BRANCH_NAME_LENGTH);
    assert!(!name.ends_with('-'));
}

#[test]
fn fallback_name_embeds_bot_and_number() {
    assert_eq!(fallback_name("bot", 7), "task/bot-7-auto-generated");
}
