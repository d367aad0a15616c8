// ABOUTME: Event log module - durable, append-only record of every task operation.
// ABOUTME: Writes are serialized through a single in-process writer task.

mod entry;
mod logger;

pub use entry::{
    ArchiveReport, EventLogEntry, LogFilter, LogInfo, OperationBreakdown, OperationStatistics,
};
pub use logger::{EventLogger, LogEvent, LogObserver};
