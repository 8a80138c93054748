use forgebot::task::{TaskDescriptor, TaskKey};
use forgebot::telemetry::{TaskStore, TokenUsageService};

fn descriptor(number: u64, user: &str) -> TaskDescriptor {
    TaskDescriptor::new(
        TaskKey::GitHubIssue {
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            number,
        },
        Some(user.to_string()),
    )
}

fn store_with_usage(dir: &std::path::Path, rows: &[(&str, i64)]) -> std::path::PathBuf {
    let path = dir.join("tasks.db");
    let store = TaskStore::open(&path).expect("open");
    for (i, (user, tokens)) in rows.iter().enumerate() {
        let descriptor = descriptor(i as u64 + 1, user);
        store.record_start(&descriptor, "test-model").expect("start");
        store
            .record_finish(&descriptor, "done", 3, 2, *tokens, 0, None)
            .expect("finish");
    }
    path
}

#[test]
fn recorded_tokens_aggregate_per_user() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = store_with_usage(dir.path(), &[("alice", 100), ("alice", 250), ("bob", 40)]);

    let service = TokenUsageService::new(&path);
    let usage = service.get_user_token_usage("alice");
    assert_eq!(usage.today, 350);
    assert_eq!(usage.this_week, 350);
    assert_eq!(usage.this_month, 350);

    let usage = service.get_user_token_usage("bob");
    assert_eq!(usage.today, 40);
}

#[test]
fn negative_token_totals_report_as_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = store_with_usage(dir.path(), &[("alice", -500)]);

    let service = TokenUsageService::new(&path);
    let usage = service.get_user_token_usage("alice");
    assert_eq!(usage.today, 0);

    let history = service.get_user_daily_history("alice", 7);
    assert!(history.history.iter().all(|day| day.tokens >= 0));
}

#[test]
fn unknown_user_reads_as_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = store_with_usage(dir.path(), &[("alice", 10)]);

    let service = TokenUsageService::new(&path);
    let usage = service.get_user_token_usage("nobody");
    assert_eq!(usage.today, 0);
    assert_eq!(usage.this_month, 0);
}

#[test]
fn missing_database_reads_as_zero_everywhere() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = TokenUsageService::new(&dir.path().join("absent.db"));

    assert_eq!(service.get_user_token_usage("alice").today, 0);
    assert!(service.get_all_users_token_usage().is_empty());
    let history = service.get_user_daily_history("alice", 5);
    assert_eq!(history.history.len(), 5);
    assert!(history.history.iter().all(|day| day.tokens == 0));
}

#[test]
fn history_days_clamp_to_one_and_365() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = store_with_usage(dir.path(), &[("alice", 10)]);
    let service = TokenUsageService::new(&path);

    // days=0 clamps up to a 1-day series.
    let history = service.get_user_daily_history("alice", 0);
    assert_eq!(history.history.len(), 1);

    // days=500 clamps down to 365.
    let history = service.get_user_daily_history("alice", 500);
    assert_eq!(history.history.len(), 365);

    let history = service.get_user_daily_history("alice", 30);
    assert_eq!(history.history.len(), 30);
    assert_eq!(history.period_end, history.history.last().expect("day").date);
    assert_eq!(
        history.period_start,
        history.history.first().expect("day").date
    );
}

#[test]
fn todays_tokens_appear_in_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = store_with_usage(dir.path(), &[("alice", 123)]);
    let service = TokenUsageService::new(&path);

    let history = service.get_user_daily_history("alice", 3);
    assert_eq!(history.history.last().expect("today").tokens, 123);
}

#[test]
fn summary_ranks_by_month_total_and_caps_at_twenty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows: Vec<(String, i64)> = (0..25)
        .map(|i| (format!("user{i:02}"), i64::from(i) * 10))
        .collect();
    let rows_ref: Vec<(&str, i64)> = rows.iter().map(|(u, t)| (u.as_str(), *t)).collect();
    let path = store_with_usage(dir.path(), &rows_ref);

    let service = TokenUsageService::new(&path);
    let summary = service.get_all_users_token_usage();
    assert_eq!(summary.len(), 20);
    // Sorted by current-month tokens, descending.
    assert_eq!(summary[0].username, "user24");
    assert!(summary
        .windows(2)
        .all(|pair| pair[0].this_month >= pair[1].this_month));
}
