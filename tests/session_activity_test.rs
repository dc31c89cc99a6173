mod helpers;

use helpers::{open_trove, test_config};
use trove::activity::{ActivityFilter, EventType, NewActivity, TimelineGrouping, TRUNCATION_MARKER};
use trove::memory::types::NewMemory;
use trove::session::ContextFlags;
use trove::{Trove, TroveError};

fn tool_call(tool: &str, file: Option<&str>, success: bool) -> NewActivity {
    let mut activity = NewActivity::new(EventType::PostToolUse);
    activity.tool_name = Some(tool.to_string());
    activity.file_path = file.map(str::to_string);
    activity.success = success;
    activity
}

#[tokio::test]
async fn next_session_sees_previous_summary() {
    let home = tempfile::tempdir().unwrap();
    let project = home.path().join("webapp");
    let trove = open_trove(home.path(), &project);

    let a = trove.start_session(None, false, None).await.unwrap();
    assert!(!a.resumed);
    assert!(a.context_summary.is_none());
    trove
        .end_session(&a.session.id, Some("Fixed login bug".into()), None)
        .await
        .unwrap();

    let b = trove.start_session(None, true, None).await.unwrap();
    assert_ne!(a.session.id, b.session.id);
    assert!(b.context_summary.unwrap().contains("Fixed login bug"));
}

#[tokio::test]
async fn context_is_scoped_to_project() {
    let home = tempfile::tempdir().unwrap();
    let project = home.path().join("webapp");
    let trove = open_trove(home.path(), &project);

    let session = trove.start_session(None, false, None).await.unwrap();
    trove
        .end_session(&session.session.id, Some("Tuned the cache".into()), None)
        .await
        .unwrap();

    let here = trove
        .session_context(None, 3, ContextFlags::default())
        .await
        .unwrap();
    assert!(here.contains("Tuned the cache"));

    let elsewhere = trove
        .session_context(Some("/some/other/project".into()), 3, ContextFlags::default())
        .await
        .unwrap();
    assert!(elsewhere.is_empty());
}

#[tokio::test]
async fn ending_twice_keeps_first_result() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));

    let start = trove
        .start_session(Some("sess_hook_made".into()), false, None)
        .await
        .unwrap();
    assert_eq!(start.session.id, "sess_hook_made");

    let first = trove
        .end_session("sess_hook_made", Some("first".into()), None)
        .await
        .unwrap();
    let second = trove
        .end_session("sess_hook_made", Some("second".into()), None)
        .await
        .unwrap();
    assert_eq!(second.summary.as_deref(), Some("first"));
    assert_eq!(first.ended_at, second.ended_at);

    let resumed = trove
        .start_session(Some("sess_hook_made".into()), false, None)
        .await
        .unwrap();
    assert!(resumed.resumed);

    assert!(matches!(
        trove.end_session("sess_unknown", None, None).await,
        Err(TroveError::NotFound { .. })
    ));
}

#[tokio::test]
async fn session_summary_counts_work() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));
    let session = trove.start_session(None, false, None).await.unwrap().session;

    trove.log_activity(tool_call("Edit", Some("src/lib.rs"), true)).await.unwrap();
    trove.log_activity(tool_call("Edit", Some("src/main.rs"), true)).await.unwrap();
    trove.log_activity(tool_call("Read", Some("README.md"), true)).await.unwrap();
    let mut failed = tool_call("Bash", None, false);
    failed.error_message = Some("exit status 101".into());
    trove.log_activity(failed).await.unwrap();
    let mut decision = NewActivity::new(EventType::Decision);
    decision.tool_input = Some("Keep the v1 API stable".into());
    trove.log_activity(decision).await.unwrap();
    trove.remember(NewMemory::new("cargo needs --locked in CI")).await.unwrap();

    let summary = trove.session_summary(&session.id).await.unwrap();
    assert_eq!(summary.total_activities, 5);
    assert_eq!(summary.tool_usage["Edit"], 2);
    assert_eq!(summary.files_modified, vec!["src/lib.rs", "src/main.rs"]);
    assert_eq!(summary.errors, vec!["exit status 101"]);
    assert_eq!(summary.key_decisions, vec!["Keep the v1 API stable"]);
    assert_eq!(summary.memories_created, 1);

    let ended = trove.end_session(&session.id, None, None).await.unwrap();
    let text = ended.summary.unwrap();
    assert!(text.starts_with("5 activities"));
    assert!(text.contains("Edit x2"));
    assert_eq!(ended.files_modified.len(), 2);
}

#[tokio::test]
async fn oversized_payloads_are_truncated_not_rejected() {
    let home = tempfile::tempdir().unwrap();
    let mut config = test_config(home.path());
    config.activity.max_output_truncation = 100;
    let trove = Trove::open(config, home.path().join("app")).unwrap();

    let mut activity = tool_call("Bash", None, true);
    activity.tool_output = Some("x".repeat(5_000));
    activity.duration_ms = Some(-3);
    let logged = trove.log_activity(activity).await.unwrap();

    let output = logged.tool_output.unwrap();
    assert!(output.ends_with(TRUNCATION_MARKER));
    assert_eq!(output.chars().count(), 100);
    assert_eq!(logged.duration_ms, None);
}

#[tokio::test]
async fn secrets_are_redacted_and_servers_derived() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));

    let mut activity = tool_call("mcp__github__create_issue", None, true);
    activity.tool_input = Some(r#"{"title":"bug","api_key":"sk-live-123","nested":{"Password":"hunter2"}}"#.into());
    let logged = trove.log_activity(activity).await.unwrap();

    let input = logged.tool_input.unwrap();
    assert!(!input.contains("sk-live-123"));
    assert!(!input.contains("hunter2"));
    assert!(input.contains("[REDACTED]"));
    assert!(input.contains("bug"));
    assert_eq!(logged.source_server.as_deref(), Some("github"));

    let filter = ActivityFilter {
        source_server: Some("github".into()),
        ..Default::default()
    };
    assert_eq!(trove.activities(filter, 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn timeline_groups_by_session() {
    let home = tempfile::tempdir().unwrap();
    let trove = open_trove(home.path(), &home.path().join("app"));

    trove.log_activity(tool_call("Grep", None, true)).await.unwrap();
    let session = trove.start_session(None, false, None).await.unwrap().session;
    trove.log_activity(tool_call("Edit", Some("a.rs"), true)).await.unwrap();
    trove.remember(NewMemory::new("timeline memory")).await.unwrap();

    let groups = trove
        .timeline(24, TimelineGrouping::Session, true, true)
        .await
        .unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].key, session.id);
    assert_eq!(groups[0].activities.len(), 1);
    assert_eq!(groups[0].memories.len(), 1);
    assert_eq!(groups[1].key, "no_session");

    let activities_only = trove
        .timeline(24, TimelineGrouping::Day, true, false)
        .await
        .unwrap();
    assert_eq!(activities_only.len(), 1);
    assert!(activities_only[0].memories.is_empty());
    assert_eq!(activities_only[0].activities.len(), 2);
}
