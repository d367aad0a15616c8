// ABOUTME: Tests for TaskContextManager lifecycle operations.
// ABOUTME: Covers ownership, target resolution, locking, progress rewrites, and auditing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::context::{NO_ACTIVE_TASK_TITLE, TaskContextManager};
use super::selection::MemorySelectionStore;
use super::types::{CompletionStatus, Marker, ProgressUpdate, StepState, TaskInit, TaskStatus};
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::error::TaskError;
use crate::eventlog::{EventLogger, LogFilter};

const DRAIN: Duration = Duration::from_secs(5);

const PLAN: &str = "# Plan\n\
    \n\
    - [ ] **Setup**: scaffold the crate\n\
    - [ ] **Build**: write the parser\n\
    - [ ] **Test**: cover edge cases\n";

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    manager: TaskContextManager,
}

impl Fixture {
    fn task_dir(&self, agent: &str, task_id: &str) -> PathBuf {
        self.root.join(agent).join(task_id)
    }
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("tasks");
    let mut config = EngineConfig::with_root(&root);
    config.log_file = dir.path().join("ops.jsonl");
    config.lock_retry_attempts = 2;
    config.lock_retry_delay = Duration::from_millis(10);

    let manager = TaskContextManager::new(
        &config,
        ConnectionManager::new(),
        Arc::new(EventLogger::new(&config.log_file)),
        Arc::new(MemorySelectionStore::new()),
    );
    manager
        .connections()
        .register(Connection::new("conn-a", "agent-a"))
        .await;
    manager
        .connections()
        .register(Connection::new("conn-b", "agent-b"))
        .await;

    Fixture {
        _dir: dir,
        root,
        manager,
    }
}

fn init(title: &str) -> TaskInit {
    TaskInit {
        title: title.to_string(),
        objective: "Make the parser faster.".to_string(),
        requirements: vec!["No API changes".to_string()],
    }
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_create_and_check_assigned_tasks() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("Speed up parser"), "conn-a").await.unwrap();
    fx.manager.create_task("T2", init("Fix docs"), "conn-a").await.unwrap();

    let tasks = fx.manager.check_assigned_tasks("conn-a").await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, "T1");
    assert_eq!(tasks[0].title, "Speed up parser");
    assert_eq!(tasks[0].status, TaskStatus::InProgress);
    assert!(tasks[0].progress.is_none());

    assert!(fx.manager.check_assigned_tasks("conn-b").await.unwrap().is_empty());
    assert_eq!(listing(&fx.task_dir("agent-a", "T1")), vec!["INIT.md"]);
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_bad_ids() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();

    let err = fx.manager.create_task("T1", init("Again"), "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidTask { ref field, .. } if field == "taskId"));

    let err = fx.manager.create_task("../escape", init("Bad"), "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidTask { ref field, .. } if field == "taskId"));
    assert!(!fx.root.join("escape").exists());

    let err = fx.manager.create_task("T3", init("  "), "conn-a").await.unwrap_err();
    assert!(err.to_string().contains("title"));
}

#[tokio::test]
async fn test_failed_create_leaves_id_free_for_retry() {
    let mut fx = fixture().await;
    fx.manager.store_mut().fail_marker_writes(Some(Marker::Init));

    let err = fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::Io(_)));
    assert!(listing(&fx.root.join("agent-a")).is_empty());
    assert!(fx.manager.check_assigned_tasks("conn-a").await.unwrap().is_empty());

    fx.manager.store_mut().fail_marker_writes(None);
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    assert_eq!(listing(&fx.task_dir("agent-a", "T1")), vec!["INIT.md"]);
}

#[tokio::test]
async fn test_start_task_names_task_and_agent_on_ownership_error() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("Mine"), "conn-a").await.unwrap();

    let err = fx.manager.start_task("T1", "conn-b").await.unwrap_err();
    assert!(matches!(err, TaskError::AgentOwnership { .. }));
    let message = err.to_string();
    assert!(message.contains("T1"));
    assert!(message.contains("agent-b"));
}

#[tokio::test]
async fn test_cross_agent_mutations_fail_without_touching_files() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("Mine"), "conn-a").await.unwrap();
    fx.manager
        .connections()
        .register(Connection::new("conn-b-t1", "agent-b").with_metadata("taskId", "T1"))
        .await;
    let before = listing(&fx.task_dir("agent-a", "T1"));

    let err = fx.manager.submit_plan(PLAN, "conn-b-t1").await.unwrap_err();
    assert!(matches!(err, TaskError::AgentOwnership { .. }));

    let updates = [ProgressUpdate::new(1, StepState::Complete, "")];
    let err = fx.manager.report_progress(&updates, "conn-b-t1").await.unwrap_err();
    assert!(matches!(err, TaskError::AgentOwnership { .. }));

    let err = fx
        .manager
        .mark_complete("DONE", "finished someone else's work", "conn-b-t1")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::AgentOwnership { .. }));

    let err = fx.manager.set_current_task("T1", "conn-b").await.unwrap_err();
    assert!(matches!(err, TaskError::AgentOwnership { .. }));

    assert_eq!(listing(&fx.task_dir("agent-a", "T1")), before);
    assert!(!fx.root.join("agent-b").exists());
}

#[tokio::test]
async fn test_empty_task_id_yields_placeholder_context() {
    let fx = fixture().await;
    let context = fx.manager.get_task_context("", "conn-a").await.unwrap();

    assert_eq!(context.title, NO_ACTIVE_TASK_TITLE);
    assert!(context.objective.is_empty());
    assert!(context.requirements.is_empty());
    assert_eq!(context.current_agent, "agent-a");
    assert!(!context.protocol_instructions.is_empty());
}

#[tokio::test]
async fn test_get_task_context_is_repeatable() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("Speed up parser"), "conn-a").await.unwrap();

    let first = fx.manager.get_task_context("T1", "conn-a").await.unwrap();
    let second = fx.manager.get_task_context("T1", "conn-a").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.objective, "Make the parser faster.");
    assert_eq!(first.requirements, vec!["No API changes"]);
}

#[tokio::test]
async fn test_start_task_selects_current_task() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.create_task("T2", init("Two"), "conn-a").await.unwrap();

    assert_eq!(fx.manager.get_current_task("conn-a").await.unwrap(), None);
    fx.manager.start_task("T1", "conn-a").await.unwrap();
    assert_eq!(
        fx.manager.get_current_task("conn-a").await.unwrap().as_deref(),
        Some("T1")
    );

    fx.manager.set_current_task("T2", "conn-a").await.unwrap();
    let submission = fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();
    assert!(submission.message.contains("T2"));
    assert!(fx.task_dir("agent-a", "T2").join("PLAN.md").exists());
    assert!(!fx.task_dir("agent-a", "T1").join("PLAN.md").exists());
}

#[tokio::test]
async fn test_connection_task_id_overrides_selection() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.create_task("T2", init("Two"), "conn-a").await.unwrap();
    fx.manager.set_current_task("T1", "conn-a").await.unwrap();
    fx.manager
        .connections()
        .register(Connection::new("conn-a-t2", "agent-a").with_metadata("taskId", "T2"))
        .await;

    fx.manager.submit_plan(PLAN, "conn-a-t2").await.unwrap();
    assert!(fx.task_dir("agent-a", "T2").join("PLAN.md").exists());
}

#[tokio::test]
async fn test_submit_plan_without_any_task_is_not_found() {
    let fx = fixture().await;
    let err = fx.manager.submit_plan(PLAN, "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
}

#[tokio::test]
async fn test_submit_plan_reports_steps_and_markers() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();

    let plan = format!("{PLAN}- [x] unlabelled step\n");
    let submission = fx.manager.submit_plan(&plan, "conn-a").await.unwrap();
    assert!(submission.success);
    assert_eq!(submission.steps_identified, 4);
    assert_eq!(
        submission.progress_markers.pending,
        vec!["Setup", "Build", "Test"]
    );
    assert!(submission.progress_markers.completed.is_empty());

    let err = fx.manager.submit_plan("   \n", "conn-a").await.unwrap_err();
    assert!(err.to_string().contains("content"));
}

#[tokio::test]
async fn test_report_progress_rewrites_only_target_glyph() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();

    let report = fx
        .manager
        .report_progress(
            &[
                ProgressUpdate::new(1, StepState::Complete, "scaffolded"),
                ProgressUpdate::new(3, StepState::Blocked, "waiting on fixtures"),
            ],
            "conn-a",
        )
        .await
        .unwrap();
    assert_eq!(report.updated_steps, 2);
    assert_eq!(report.summary.completed, 1);
    assert_eq!(report.summary.pending, 1);
    assert_eq!(report.summary.blocked, 1);

    let plan = std::fs::read_to_string(fx.task_dir("agent-a", "T1").join("PLAN.md")).unwrap();
    assert_eq!(
        plan,
        PLAN.replacen("- [ ] **Setup**", "- [x] **Setup**", 1)
            .replacen("- [ ] **Test**", "- [!] **Test**", 1)
    );
    assert_eq!(
        TaskContextManager::analyze_plan_progress(&plan),
        report.summary
    );
}

#[tokio::test]
async fn test_report_progress_out_of_range_leaves_plan_untouched() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();

    let err = fx
        .manager
        .report_progress(
            &[
                ProgressUpdate::new(1, StepState::Complete, ""),
                ProgressUpdate::new(4, StepState::Complete, ""),
            ],
            "conn-a",
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("updates[1].step"));

    let plan = std::fs::read_to_string(fx.task_dir("agent-a", "T1").join("PLAN.md")).unwrap();
    assert_eq!(plan, PLAN);
}

#[tokio::test]
async fn test_report_progress_without_plan_succeeds_with_no_updates() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();

    let report = fx
        .manager
        .report_progress(&[ProgressUpdate::new(1, StepState::Complete, "")], "conn-a")
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.updated_steps, 0);
    assert!(!fx.task_dir("agent-a", "T1").join("PLAN.md").exists());
}

#[tokio::test]
async fn test_mark_complete_validates_input() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();

    let err = fx
        .manager
        .mark_complete("FINISHED", "a long enough summary", "conn-a")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::InvalidTask { ref field, .. } if field == "status"));

    let err = fx.manager.mark_complete("DONE", "short", "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidTask { ref field, .. } if field == "summary"));

    assert_eq!(listing(&fx.task_dir("agent-a", "T1")), vec!["INIT.md"]);
}

#[tokio::test]
async fn test_mark_complete_is_terminal() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.start_task("T1", "conn-a").await.unwrap();
    fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();

    let result = fx
        .manager
        .mark_complete("error", "fixtures are unavailable", "conn-a")
        .await
        .unwrap();
    assert_eq!(result.status, CompletionStatus::Error);
    assert!(result.is_error);
    assert!(result.recommendations.iter().any(|r| r.contains("ERROR.md")));
    assert_eq!(fx.manager.get_current_task("conn-a").await.unwrap(), None);

    let dir = fx.task_dir("agent-a", "T1");
    assert_eq!(listing(&dir), vec!["ERROR.md", "INIT.md", "PLAN.md"]);

    // Falls back to the most recently modified task, which is now terminal.
    let err = fx
        .manager
        .mark_complete("DONE", "trying to flip the outcome", "conn-a")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::TerminalState { .. }));
    let err = fx.manager.submit_plan(PLAN, "conn-a").await.unwrap_err();
    assert!(matches!(err, TaskError::TerminalState { .. }));

    // Failed mutations still released their lock.
    assert_eq!(listing(&dir), vec!["ERROR.md", "INIT.md", "PLAN.md"]);
}

#[tokio::test]
async fn test_failed_completion_write_leaves_task_open() {
    let mut fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.start_task("T1", "conn-a").await.unwrap();
    fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();
    fx.manager.store_mut().fail_marker_writes(Some(Marker::Done));

    let err = fx
        .manager
        .mark_complete("DONE", "every step is finished", "conn-a")
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Io(_)));

    // No marker, no staging file, and the lock was released.
    let dir = fx.task_dir("agent-a", "T1");
    assert_eq!(listing(&dir), vec!["INIT.md", "PLAN.md"]);
    assert_eq!(
        fx.manager.get_current_task("conn-a").await.unwrap().as_deref(),
        Some("T1")
    );
    let tasks = fx.manager.check_assigned_tasks("conn-a").await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::InProgress);

    fx.manager.logger().wait_for_write_queue_empty(DRAIN).await.unwrap();
    let audited = fx
        .manager
        .logger()
        .get_log_entries(&LogFilter::new().operation("mark_complete"))
        .await
        .unwrap();
    assert_eq!(audited.len(), 1);
    assert!(!audited[0].success);

    fx.manager.store_mut().fail_marker_writes(None);
    let result = fx
        .manager
        .mark_complete("DONE", "every step is finished", "conn-a")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(listing(&dir), vec!["DONE.md", "INIT.md", "PLAN.md"]);
}

#[tokio::test]
async fn test_contended_lock_surfaces_lock_unavailable() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    let dir = fx.task_dir("agent-a", "T1");

    let held = fx.manager.locks().acquire_lock(&dir, "other-tool").await.unwrap();
    assert!(held.acquired);

    let err = fx.manager.submit_plan(PLAN, "conn-a").await.unwrap_err();
    match err {
        TaskError::LockUnavailable { task_id, reason } => {
            assert_eq!(task_id, "T1");
            assert!(reason.contains("other-tool"));
        }
        other => panic!("Expected LockUnavailable, got {:?}", other),
    }
    assert!(!dir.join("PLAN.md").exists());

    // The foreign lock is left in place.
    let status = fx.manager.locks().check_lock(&dir).await.unwrap();
    assert_eq!(status.lock_info.unwrap().lock_id, held.lock_id.unwrap());
}

#[tokio::test]
async fn test_unknown_connection_is_rejected_and_audited() {
    let fx = fixture().await;
    let err = fx.manager.check_assigned_tasks("ghost").await.unwrap_err();
    assert!(matches!(err, TaskError::UnknownConnection(ref id) if id == "ghost"));

    fx.manager.logger().wait_for_write_queue_empty(DRAIN).await.unwrap();
    let entries = fx
        .manager
        .logger()
        .get_log_entries(&LogFilter::new())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].agent, "unknown");
    assert!(!entries[0].success);
}

#[tokio::test]
async fn test_every_operation_is_audited() {
    let fx = fixture().await;
    fx.manager.create_task("T1", init("One"), "conn-a").await.unwrap();
    fx.manager.start_task("T1", "conn-a").await.unwrap();
    fx.manager.submit_plan(PLAN, "conn-a").await.unwrap();
    let _ = fx.manager.mark_complete("DONE", "short", "conn-a").await;
    fx.manager.logger().wait_for_write_queue_empty(DRAIN).await.unwrap();

    let entries = fx
        .manager
        .logger()
        .get_log_entries(&LogFilter::new().agent("agent-a"))
        .await
        .unwrap();
    let operations: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(
        operations,
        vec!["create_task", "start_task", "submit_plan", "mark_complete"]
    );
    assert!(entries[..3].iter().all(|e| e.success));
    assert_eq!(entries[2].task_id.as_deref(), Some("T1"));
    assert_eq!(entries[2].metadata.as_ref().unwrap()["stepsIdentified"], 3);
    assert!(entries[3].error.as_deref().unwrap().contains("summary"));
}

#[tokio::test]
async fn test_operations_stamp_connection_activity() {
    let fx = fixture().await;
    let before = fx
        .manager
        .connections()
        .get_connection("conn-a")
        .await
        .unwrap()
        .last_seen();
    tokio::time::sleep(Duration::from_millis(5)).await;

    fx.manager.get_task_context("", "conn-a").await.unwrap();
    let after = fx
        .manager
        .connections()
        .get_connection("conn-a")
        .await
        .unwrap()
        .last_seen();
    assert!(after > before);
}
