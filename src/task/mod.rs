// ABOUTME: Task module - the on-disk task store, plan checklist parsing, current
// ABOUTME: task selection, and the TaskContextManager lifecycle operations.

mod checklist;
mod context;
mod selection;
mod store;
mod types;

pub use checklist::{
    ChecklistItem, analyze_plan_progress, apply_updates, extract_progress_markers,
    parse_checklist,
};
pub use context::{NO_ACTIVE_TASK_TITLE, PROTOCOL_INSTRUCTIONS, TaskContextManager};
pub use selection::{
    FileSelectionStore, MemorySelectionStore, SELECTION_FILE_NAME, SelectionStore,
};
pub use store::{TaskStore, parse_init, render_init};
pub use types::{
    CompletionResult, CompletionStatus, Marker, PlanSubmission, ProgressMarkers, ProgressReport,
    ProgressSummary, ProgressUpdate, StepState, Task, TaskContext, TaskFlags, TaskInit,
    TaskStatus, TaskSummary,
};

#[cfg(test)]
mod context_test;
