#[path = "test_utils.rs"]
mod test_utils;

use forgebot::comments::CommentWatcher;
use test_utils::{make_task, MockForge};

#[tokio::test]
async fn initialize_seeds_observed_ids_from_existing_comments() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    forge.push_comment("2", "bob", "second", 1);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher.initialize(&task).await;

    assert!(watcher.observed_ids().contains("1"));
    assert!(watcher.observed_ids().contains("2"));

    // Nothing new yet.
    let fresh = watcher.check_for_new_comments(&task).await;
    assert!(fresh.is_empty());
}

#[tokio::test]
async fn new_human_comment_is_detected_exactly_once() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher.initialize(&task).await;

    forge.push_comment("2", "bob", "please use type hints", 5);
    let fresh = watcher.check_for_new_comments(&task).await;
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].author, "bob");

    // Monotone: the same comment never surfaces twice.
    let again = watcher.check_for_new_comments(&task).await;
    assert!(again.is_empty());
    assert!(watcher.observed_ids().contains("2"));
}

#[tokio::test]
async fn bot_comments_are_filtered_but_still_recorded() {
    let forge = MockForge::new();
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher.initialize(&task).await;

    forge.push_comment("10", "forgebot", "status update", 2);
    let fresh = watcher.check_for_new_comments(&task).await;
    assert!(fresh.is_empty());
    assert!(watcher.observed_ids().contains("10"));
}

#[tokio::test]
async fn fetch_failure_returns_empty_and_keeps_state() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher.initialize(&task).await;

    *forge.fail_comment_fetch.lock() = true;
    let fresh = watcher.check_for_new_comments(&task).await;
    assert!(fresh.is_empty());
    assert!(watcher.observed_ids().contains("1"));
}

#[tokio::test]
async fn watcher_without_bot_username_is_a_noop() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(None);
    assert!(!watcher.is_enabled());
    watcher.initialize(&task).await;
    assert!(watcher.observed_ids().is_empty());

    forge.push_comment("2", "bob", "second", 1);
    assert!(watcher.check_for_new_comments(&task).await.is_empty());
}

#[tokio::test]
async fn state_round_trip_preserves_ids_and_timestamp() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    forge.push_comment("2", "bob", "second", 1);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher.initialize(&task).await;
    let state = watcher.state();

    let mut restored = CommentWatcher::new(Some("forgebot".to_string()));
    restored.restore_state(state.clone(), &task).await;

    assert_eq!(restored.observed_ids(), watcher.observed_ids());
    assert_eq!(restored.state().last_check_time, state.last_check_time);
}

#[tokio::test]
async fn empty_state_restores_via_fresh_snapshot() {
    let forge = MockForge::new();
    forge.push_comment("1", "alice", "first", 0);
    let task = make_task(forge.clone());

    let mut watcher = CommentWatcher::new(Some("forgebot".to_string()));
    watcher
        .restore_state(forgebot::comments::CommentWatcherState::default(), &task)
        .await;

    // Fallback behaves like initialize().
    assert!(watcher.observed_ids().contains("1"));
}

#[test]
fn single_comment_format_uses_short_form() {
    let comment = forgebot::task::Comment {
        id: "1".to_string(),
        author: "bob".to_string(),
        body: "please add tests".to_string(),
        created_at: test_utils::timestamp(0),
        kind: forgebot::task::CommentKind::IssueComment,
    };
    let block = CommentWatcher::format_block(&[comment]);
    assert_eq!(block, "[New Comment from @bob]:\nplease add tests");
}

#[test]
fn multi_comment_format_is_a_numbered_list() {
    let make = |id: &str, author: &str, body: &str| forgebot::task::Comment {
        id: id.to_string(),
        author: author.to_string(),
        body: body.to_string(),
        created_at: test_utils::timestamp(3),
        kind: forgebot::task::CommentKind::IssueComment,
    };
    let block = CommentWatcher::format_block(&[
        make("1", "bob", "first note"),
        make("2", "carol", "second note"),
    ]);
    assert!(block.starts_with("[New Comments Detected]:"));
    assert!(block.contains("Comment 1 from @bob"));
    assert!(block.contains("Comment 2 from @carol"));
    assert!(block.contains("second note"));
}
