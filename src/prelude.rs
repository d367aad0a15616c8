// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use taskmux::prelude::*;` to get started quickly.

pub use crate::config::EngineConfig;
pub use crate::connection::{Connection, ConnectionManager, ConnectionStatistics};
pub use crate::error::{ConfigError, LockError, LogError, TaskError, TaskmuxError};
pub use crate::eventlog::{
    ArchiveReport, EventLogEntry, EventLogger, LogEvent, LogFilter, LogInfo, OperationStatistics,
};
pub use crate::lock::{LockAcquisition, LockInfo, LockManager, LockRelease, LockStatus};
pub use crate::task::{
    CompletionResult, CompletionStatus, FileSelectionStore, MemorySelectionStore, PlanSubmission,
    ProgressMarkers, ProgressReport, ProgressSummary, ProgressUpdate, SelectionStore, StepState,
    Task, TaskContext, TaskContextManager, TaskInit, TaskStatus, TaskStore, TaskSummary,
};
