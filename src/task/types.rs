// ABOUTME: Defines task state (flags, status enum) and the result shapes
// ABOUTME: returned by TaskContextManager operations.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Marker files whose presence encodes task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Init,
    Plan,
    Done,
    Error,
}

impl Marker {
    pub const ALL: [Marker; 4] = [Marker::Init, Marker::Plan, Marker::Done, Marker::Error];

    pub fn file_name(self) -> &'static str {
        match self {
            Marker::Init => "INIT.md",
            Marker::Plan => "PLAN.md",
            Marker::Done => "DONE.md",
            Marker::Error => "ERROR.md",
        }
    }
}

/// Which marker files exist in a task directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFlags {
    pub has_init: bool,
    pub has_plan: bool,
    pub has_done: bool,
    pub has_error: bool,
}

impl TaskFlags {
    pub(crate) fn set(&mut self, marker: Marker) {
        match marker {
            Marker::Init => self.has_init = true,
            Marker::Plan => self.has_plan = true,
            Marker::Done => self.has_done = true,
            Marker::Error => self.has_error = true,
        }
    }
}

/// Lifecycle status derived from [`TaskFlags`].
///
/// `New -> InProgress -> {Completed, Error}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    InProgress,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn from_flags(flags: TaskFlags) -> Self {
        if flags.has_error {
            TaskStatus::Error
        } else if flags.has_done {
            TaskStatus::Completed
        } else if flags.has_plan || flags.has_init {
            TaskStatus::InProgress
        } else {
            TaskStatus::New
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::New => write!(f, "new"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// A task as found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub agent: String,
    pub id: String,
    pub flags: TaskFlags,
    pub status: TaskStatus,
    /// Latest modification time of the directory or any marker.
    pub modified: Option<DateTime<Utc>>,
}

/// Content of a task's INIT.md.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInit {
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// State of one checklist step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    InProgress,
    #[serde(alias = "completed")]
    Complete,
    Blocked,
}

impl StepState {
    /// The character between the checkbox brackets.
    pub fn glyph(self) -> char {
        match self {
            StepState::Pending => ' ',
            StepState::InProgress => '~',
            StepState::Complete => 'x',
            StepState::Blocked => '!',
        }
    }

    pub fn from_glyph(glyph: char) -> Option<Self> {
        match glyph {
            ' ' => Some(StepState::Pending),
            '~' => Some(StepState::InProgress),
            'x' | 'X' => Some(StepState::Complete),
            '!' => Some(StepState::Blocked),
            _ => None,
        }
    }
}

impl FromStr for StepState {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(StepState::Pending),
            "in_progress" | "in-progress" => Ok(StepState::InProgress),
            "complete" | "completed" | "done" => Ok(StepState::Complete),
            "blocked" => Ok(StepState::Blocked),
            other => Err(TaskError::invalid(
                "status",
                format!("unknown step status '{other}'"),
            )),
        }
    }
}

/// Counts of checklist steps by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub blocked: usize,
}

impl ProgressSummary {
    pub fn total(&self) -> usize {
        self.completed + self.in_progress + self.pending + self.blocked
    }
}

/// Titles of bold-emphasized checklist steps, split by completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressMarkers {
    pub completed: Vec<String>,
    /// Every step not yet complete, including in-progress and blocked ones.
    pub pending: Vec<String>,
}

/// One entry of a progress report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// 1-based position among top-level checklist lines.
    pub step: usize,
    pub status: StepState,
    #[serde(default)]
    pub description: String,
}

impl ProgressUpdate {
    pub fn new(step: usize, status: StepState, description: impl Into<String>) -> Self {
        Self {
            step,
            status,
            description: description.into(),
        }
    }
}

/// Row of `check_assigned_tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSummary>,
}

/// What an agent needs to work on a task. Never contains filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub title: String,
    pub objective: String,
    pub requirements: Vec<String>,
    pub current_agent: String,
    pub protocol_instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_progress: Option<ProgressSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSubmission {
    pub success: bool,
    pub message: String,
    pub steps_identified: usize,
    pub progress_markers: ProgressMarkers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub success: bool,
    pub updated_steps: usize,
    pub summary: ProgressSummary,
}

/// Terminal outcome written by `mark_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Done,
    Error,
}

impl CompletionStatus {
    pub fn marker(self) -> Marker {
        match self {
            CompletionStatus::Done => Marker::Done,
            CompletionStatus::Error => Marker::Error,
        }
    }
}

impl FromStr for CompletionStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DONE" => Ok(CompletionStatus::Done),
            "ERROR" => Ok(CompletionStatus::Error),
            _ => Err(TaskError::invalid(
                "status",
                format!("expected DONE or ERROR, got '{s}'"),
            )),
        }
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionStatus::Done => write!(f, "DONE"),
            CompletionStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub success: bool,
    pub status: CompletionStatus,
    pub summary: String,
    pub completed_at: DateTime<Utc>,
    pub is_error: bool,
    pub recommendations: Vec<String>,
}
