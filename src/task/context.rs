// ABOUTME: Implements TaskContextManager - the task lifecycle operations agents call.
// ABOUTME: Resolves identity per connection, locks every mutation, and audits every call.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use super::checklist::{self, apply_updates, parse_checklist};
use super::selection::{FileSelectionStore, SELECTION_FILE_NAME, SelectionStore};
use super::store::TaskStore;
use super::types::{
    CompletionResult, CompletionStatus, Marker, PlanSubmission, ProgressMarkers, ProgressReport,
    ProgressSummary, ProgressUpdate, Task, TaskContext, TaskInit, TaskSummary,
};
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::TaskError;
use crate::eventlog::{EventLogEntry, EventLogger};
use crate::lock::LockManager;

/// Title of the context returned when no task is requested.
pub const NO_ACTIVE_TASK_TITLE: &str = "No Active Task";

/// Workflow guidance handed to every agent with its task context.
pub const PROTOCOL_INSTRUCTIONS: &str = "\
1. Read the objective and requirements before changing anything.
2. Submit a plan as a markdown checklist: one `- [ ] **Title**: description` line per step.
3. Report progress by step number as you go: `[~]` in progress, `[x]` complete, `[!]` blocked.
4. Finish with DONE and a summary of what changed, or ERROR and a summary of what went wrong.";

// Agent recorded for operations whose connection could not be resolved.
const UNKNOWN_AGENT: &str = "unknown";

/// Per-call audit record, flushed to the event log when the operation ends.
struct Audit {
    operation: &'static str,
    agent: Option<String>,
    task_id: Option<String>,
    started: Instant,
    metadata: Vec<(&'static str, serde_json::Value)>,
}

impl Audit {
    fn begin(operation: &'static str) -> Self {
        Self {
            operation,
            agent: None,
            task_id: None,
            started: Instant::now(),
            metadata: Vec::new(),
        }
    }

    fn note(&mut self, key: &'static str, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.push((key, v));
        }
    }

    fn into_entry<T>(self, result: &Result<T, TaskError>) -> EventLogEntry {
        let mut entry = EventLogEntry::new(
            self.operation,
            self.agent.unwrap_or_else(|| UNKNOWN_AGENT.to_string()),
        )
        .with_duration(self.started.elapsed());
        if let Some(task_id) = self.task_id {
            entry = entry.with_task(task_id);
        }
        for (key, value) in self.metadata {
            entry = entry.with_metadata(key, value);
        }
        match result {
            Ok(_) => entry,
            Err(e) => entry.failed(e.to_string()),
        }
    }
}

/// Task lifecycle engine.
///
/// Every operation resolves the calling agent from its connection id, acts
/// only inside that agent's namespace, and appends one entry to the event
/// log whether it succeeds or fails. Mutations hold the task's lock for the
/// duration of their file writes and always release it.
pub struct TaskContextManager {
    store: TaskStore,
    connections: ConnectionManager,
    locks: LockManager,
    logger: Arc<EventLogger>,
    selection: Arc<dyn SelectionStore>,
    lock_retry_attempts: u32,
    lock_retry_delay: Duration,
    min_summary_len: usize,
}

impl TaskContextManager {
    /// Build a manager from explicit collaborators.
    pub fn new(
        config: &EngineConfig,
        connections: ConnectionManager,
        logger: Arc<EventLogger>,
        selection: Arc<dyn SelectionStore>,
    ) -> Self {
        Self {
            store: TaskStore::new(&config.task_root),
            connections,
            locks: LockManager::new(config.lock_stale_after),
            logger,
            selection,
            lock_retry_attempts: config.lock_retry_attempts,
            lock_retry_delay: config.lock_retry_delay,
            min_summary_len: config.min_summary_len,
        }
    }

    /// Build a manager with a fresh connection registry, a logger on
    /// `config.log_file`, and selections persisted beside the task root.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_config(config: &EngineConfig) -> Self {
        let connections = ConnectionManager::with_stale_after(config.connection_stale_after);
        let logger = Arc::new(EventLogger::new(&config.log_file));
        let selection = Arc::new(FileSelectionStore::new(
            config.task_root.join(SELECTION_FILE_NAME),
        ));
        Self::new(config, connections, logger, selection)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn logger(&self) -> &Arc<EventLogger> {
        &self.logger
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn store_mut(&mut self) -> &mut TaskStore {
        &mut self.store
    }

    /// Count checklist steps by state.
    pub fn analyze_plan_progress(content: &str) -> ProgressSummary {
        checklist::analyze_plan_progress(content)
    }

    /// Titles of bold-emphasized checklist steps.
    pub fn extract_progress_markers(content: &str) -> ProgressMarkers {
        checklist::extract_progress_markers(content)
    }

    /// Every task owned by the calling agent, with title, status, and progress.
    pub async fn check_assigned_tasks(
        &self,
        connection_id: &str,
    ) -> Result<Vec<TaskSummary>, TaskError> {
        let mut audit = Audit::begin("check_assigned_tasks");
        let result: Result<Vec<TaskSummary>, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            let tasks = self.store.agent_tasks(&agent).await?;
            let summaries =
                futures::future::try_join_all(tasks.iter().map(|task| self.summarize(task)))
                    .await?;
            audit.note("taskCount", summaries.len());
            Ok(summaries)
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Create a task in the calling agent's namespace and write its INIT.md.
    pub async fn create_task(
        &self,
        task_id: &str,
        init: TaskInit,
        connection_id: &str,
    ) -> Result<TaskContext, TaskError> {
        let mut audit = Audit::begin("create_task");
        audit.task_id = Some(task_id.to_string());
        let result: Result<TaskContext, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            if init.title.trim().is_empty() {
                return Err(TaskError::invalid("title", "must not be empty"));
            }
            let task = self.store.create_task(&agent, task_id, &init).await?;

            tracing::info!(agent = %agent, task_id, "task created");
            self.build_context(&task, &agent).await
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Start working on a task: returns its context and selects it as the
    /// agent's current task.
    pub async fn start_task(
        &self,
        task_id: &str,
        connection_id: &str,
    ) -> Result<TaskContext, TaskError> {
        let mut audit = Audit::begin("start_task");
        audit.task_id = Some(task_id.to_string());
        let result: Result<TaskContext, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            let task = self.owned_task(&agent, task_id).await?;
            let context = self.build_context(&task, &agent).await?;
            self.selection
                .set(&agent, task_id)
                .await
                .map_err(TaskError::Selection)?;
            Ok(context)
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Context for `task_id`. An empty id yields the "No Active Task" placeholder.
    pub async fn get_task_context(
        &self,
        task_id: &str,
        connection_id: &str,
    ) -> Result<TaskContext, TaskError> {
        let mut audit = Audit::begin("get_task_context");
        if !task_id.is_empty() {
            audit.task_id = Some(task_id.to_string());
        }
        let result: Result<TaskContext, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            if task_id.is_empty() {
                return Ok(TaskContext {
                    title: NO_ACTIVE_TASK_TITLE.to_string(),
                    objective: String::new(),
                    requirements: Vec::new(),
                    current_agent: agent,
                    protocol_instructions: PROTOCOL_INSTRUCTIONS.to_string(),
                    current_progress: None,
                });
            }
            let task = self.owned_task(&agent, task_id).await?;
            self.build_context(&task, &agent).await
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Write PLAN.md for the resolved task and report the steps it contains.
    pub async fn submit_plan(
        &self,
        content: &str,
        connection_id: &str,
    ) -> Result<PlanSubmission, TaskError> {
        let mut audit = Audit::begin("submit_plan");
        let result: Result<PlanSubmission, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            if content.trim().is_empty() {
                return Err(TaskError::invalid("content", "plan must not be empty"));
            }
            let task_id = self.resolve_target(&agent, connection_id).await?;
            audit.task_id = Some(task_id.clone());
            let task = self.owned_task(&agent, &task_id).await?;

            let dir = self.store.task_dir(&agent, &task_id)?;
            let lock_id = self.acquire_task_lock(&dir, &task_id, "submit_plan").await?;
            let written = async {
                self.ensure_open(&agent, &task_id).await?;
                self.store.write_marker(&task, Marker::Plan, content).await
            }
            .await;
            self.release_task_lock(&dir, &lock_id).await;
            written?;

            let steps = parse_checklist(content).len();
            audit.note("stepsIdentified", steps);
            tracing::info!(agent = %agent, task_id = %task_id, steps, "plan submitted");
            Ok(PlanSubmission {
                success: true,
                message: format!("Plan submitted for task '{task_id}' with {steps} steps"),
                steps_identified: steps,
                progress_markers: checklist::extract_progress_markers(content),
            })
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Rewrite the checkbox glyph of each updated plan step.
    ///
    /// A task without a plan reports success with nothing updated. An
    /// out-of-range step rejects the whole batch.
    pub async fn report_progress(
        &self,
        updates: &[ProgressUpdate],
        connection_id: &str,
    ) -> Result<ProgressReport, TaskError> {
        let mut audit = Audit::begin("report_progress");
        let result: Result<ProgressReport, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            let task_id = self.resolve_target(&agent, connection_id).await?;
            audit.task_id = Some(task_id.clone());
            let task = self.owned_task(&agent, &task_id).await?;

            let dir = self.store.task_dir(&agent, &task_id)?;
            let lock_id = self
                .acquire_task_lock(&dir, &task_id, "report_progress")
                .await?;
            let outcome: Result<ProgressReport, TaskError> = async {
                self.ensure_open(&agent, &task_id).await?;
                let Some(plan) = self.store.read_plan(&task).await? else {
                    return Ok(ProgressReport {
                        success: true,
                        updated_steps: 0,
                        summary: ProgressSummary::default(),
                    });
                };
                let updated = apply_updates(&plan, updates)?;
                if !updates.is_empty() {
                    self.store.write_marker(&task, Marker::Plan, &updated).await?;
                }
                Ok(ProgressReport {
                    success: true,
                    updated_steps: updates.len(),
                    summary: checklist::analyze_plan_progress(&updated),
                })
            }
            .await;
            self.release_task_lock(&dir, &lock_id).await;

            let report = outcome?;
            audit.note("updatedSteps", report.updated_steps);
            audit.note("summary", report.summary);
            Ok(report)
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Finish the resolved task by writing DONE.md or ERROR.md.
    ///
    /// `status` must be `DONE` or `ERROR` (any case) and `summary` at least
    /// the configured minimum length. Clears the agent's selection if it
    /// pointed at this task.
    pub async fn mark_complete(
        &self,
        status: &str,
        summary: &str,
        connection_id: &str,
    ) -> Result<CompletionResult, TaskError> {
        let mut audit = Audit::begin("mark_complete");
        audit.note("status", status);
        let result: Result<CompletionResult, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            let status: CompletionStatus = status.parse()?;
            let summary = summary.trim();
            if summary.chars().count() < self.min_summary_len {
                return Err(TaskError::invalid(
                    "summary",
                    format!("must be at least {} characters", self.min_summary_len),
                ));
            }

            let task_id = self.resolve_target(&agent, connection_id).await?;
            audit.task_id = Some(task_id.clone());
            let task = self.owned_task(&agent, &task_id).await?;

            let dir = self.store.task_dir(&agent, &task_id)?;
            let lock_id = self.acquire_task_lock(&dir, &task_id, "mark_complete").await?;
            let completed_at = Utc::now();
            let outcome: Result<Option<String>, TaskError> = async {
                self.ensure_open(&agent, &task_id).await?;
                let plan = self.store.read_plan(&task).await?;
                let body = render_completion(status, summary, &agent, completed_at);
                self.store.write_marker(&task, status.marker(), &body).await?;
                Ok(plan)
            }
            .await;
            self.release_task_lock(&dir, &lock_id).await;
            let plan = outcome?;

            match self.selection.get(&agent).await {
                Ok(Some(selected)) if selected == task_id => {
                    if let Err(e) = self.selection.clear(&agent).await {
                        tracing::warn!(agent = %agent, error = %e, "failed to clear current task");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(agent = %agent, error = %e, "failed to read current task"),
            }

            tracing::info!(agent = %agent, task_id = %task_id, %status, "task completed");
            Ok(CompletionResult {
                success: true,
                status,
                summary: summary.to_string(),
                completed_at,
                is_error: status == CompletionStatus::Error,
                recommendations: recommendations(status, &task_id, plan.as_deref()),
            })
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Select `task_id` as the agent's current task.
    pub async fn set_current_task(
        &self,
        task_id: &str,
        connection_id: &str,
    ) -> Result<(), TaskError> {
        let mut audit = Audit::begin("set_current_task");
        audit.task_id = Some(task_id.to_string());
        let result: Result<(), TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            self.owned_task(&agent, task_id).await?;
            self.selection
                .set(&agent, task_id)
                .await
                .map_err(TaskError::Selection)
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// The agent's current task selection, if any.
    pub async fn get_current_task(&self, connection_id: &str) -> Result<Option<String>, TaskError> {
        let mut audit = Audit::begin("get_current_task");
        let result: Result<Option<String>, TaskError> = async {
            let agent = self.resolve_agent(connection_id, &mut audit).await?;
            self.selection
                .get(&agent)
                .await
                .map_err(TaskError::Selection)
        }
        .await;
        self.finish(audit, &result);
        result
    }

    /// Agent behind `connection_id`. Stamps the connection's activity.
    async fn resolve_agent(
        &self,
        connection_id: &str,
        audit: &mut Audit,
    ) -> Result<String, TaskError> {
        let connection = self
            .connections
            .get_connection(connection_id)
            .await
            .ok_or_else(|| TaskError::UnknownConnection(connection_id.to_string()))?;
        self.connections.update_activity(connection_id).await;
        audit.agent = Some(connection.agent.clone());
        Ok(connection.agent)
    }

    async fn summarize(&self, task: &Task) -> Result<TaskSummary, TaskError> {
        let title = self
            .store
            .read_init(task)
            .await?
            .map_or_else(|| task.id.clone(), |init| init.title);
        let progress = self
            .store
            .read_plan(task)
            .await?
            .map(|plan| checklist::analyze_plan_progress(&plan));
        Ok(TaskSummary {
            task_id: task.id.clone(),
            title,
            status: task.status,
            progress,
        })
    }

    /// Task targeted by an operation without an explicit id: the connection's
    /// `taskId` metadata, else the agent's selection, else the most recently
    /// modified task.
    async fn resolve_target(&self, agent: &str, connection_id: &str) -> Result<String, TaskError> {
        if let Some(connection) = self.connections.get_connection(connection_id).await {
            if let Some(task_id) = connection.task_id() {
                return Ok(task_id.to_string());
            }
        }
        if let Some(task_id) = self
            .selection
            .get(agent)
            .await
            .map_err(TaskError::Selection)?
        {
            return Ok(task_id);
        }
        self.store
            .agent_tasks(agent)
            .await?
            .into_iter()
            .max_by_key(|task| task.modified)
            .map(|task| task.id)
            .ok_or_else(|| TaskError::NotFound(format!("no task found for agent '{agent}'")))
    }

    /// The task, if it lives in `agent`'s namespace. Checked before any mutation.
    async fn owned_task(&self, agent: &str, task_id: &str) -> Result<Task, TaskError> {
        self.store
            .task(agent, task_id)
            .await?
            .ok_or_else(|| TaskError::AgentOwnership {
                task_id: task_id.to_string(),
                agent: agent.to_string(),
            })
    }

    /// Re-read state under the lock and refuse to touch a finished task.
    async fn ensure_open(&self, agent: &str, task_id: &str) -> Result<(), TaskError> {
        let task = self.owned_task(agent, task_id).await?;
        if task.status.is_terminal() {
            return Err(TaskError::TerminalState {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
            });
        }
        Ok(())
    }

    async fn build_context(&self, task: &Task, agent: &str) -> Result<TaskContext, TaskError> {
        let init = self.store.read_init(task).await?.unwrap_or_else(|| TaskInit {
            title: task.id.clone(),
            ..TaskInit::default()
        });
        let current_progress = self
            .store
            .read_plan(task)
            .await?
            .map(|plan| checklist::analyze_plan_progress(&plan));
        Ok(TaskContext {
            title: init.title,
            objective: init.objective,
            requirements: init.requirements,
            current_agent: agent.to_string(),
            protocol_instructions: PROTOCOL_INSTRUCTIONS.to_string(),
            current_progress,
        })
    }

    async fn acquire_task_lock(
        &self,
        dir: &Path,
        task_id: &str,
        tool: &str,
    ) -> Result<String, TaskError> {
        let attempts = self.lock_retry_attempts.max(1);
        let mut reason = None;
        for attempt in 1..=attempts {
            let acquisition = self.locks.acquire_lock(dir, tool).await?;
            if let (true, Some(lock_id)) = (acquisition.acquired, acquisition.lock_id) {
                return Ok(lock_id);
            }
            reason = acquisition.reason;
            if attempt < attempts {
                tracing::debug!(task_id, attempt, "task lock busy, retrying");
                tokio::time::sleep(self.lock_retry_delay).await;
            }
        }
        Err(TaskError::LockUnavailable {
            task_id: task_id.to_string(),
            reason: reason.unwrap_or_else(|| "lock held by another holder".to_string()),
        })
    }

    async fn release_task_lock(&self, dir: &Path, lock_id: &str) {
        match self.locks.release_lock(dir, lock_id).await {
            Ok(release) if release.released => {}
            Ok(release) => tracing::warn!(
                dir = %dir.display(),
                reason = release.reason.as_deref().unwrap_or(""),
                "task lock not released"
            ),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to release task lock"),
        }
    }

    fn finish<T>(&self, audit: Audit, result: &Result<T, TaskError>) {
        let operation = audit.operation;
        if let Err(e) = self.logger.log_operation(audit.into_entry(result)) {
            tracing::warn!(operation, error = %e, "failed to record operation");
        }
    }
}

fn render_completion(
    status: CompletionStatus,
    summary: &str,
    agent: &str,
    completed_at: chrono::DateTime<Utc>,
) -> String {
    format!(
        "# {status}\n\nCompleted at: {}\nAgent: {agent}\n\n## Summary\n\n{summary}\n",
        completed_at.to_rfc3339()
    )
}

fn recommendations(status: CompletionStatus, task_id: &str, plan: Option<&str>) -> Vec<String> {
    let mut out = Vec::new();
    if status == CompletionStatus::Error {
        out.push(format!(
            "Review ERROR.md for task '{task_id}' and decide whether to retry or reassign it."
        ));
    }
    let Some(plan) = plan else {
        out.push("No plan was submitted; submit a plan before starting similar work.".to_string());
        return out;
    };

    let progress = checklist::analyze_plan_progress(plan);
    let unfinished = progress.pending + progress.in_progress;
    if status == CompletionStatus::Done && unfinished > 0 {
        out.push(format!(
            "{unfinished} plan steps were not marked complete; confirm they are no longer needed."
        ));
    }
    if progress.blocked > 0 {
        out.push(format!(
            "{} plan steps are blocked; record the blockers for follow-up.",
            progress.blocked
        ));
    }
    if out.is_empty() {
        out.push("All plan steps are complete; check for newly assigned tasks.".to_string());
    }
    out
}
