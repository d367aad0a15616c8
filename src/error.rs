// ABOUTME: Defines all error types for the taskmux library using thiserror.
// ABOUTME: Each subsystem has its own error enum, unified under TaskmuxError.

use std::time::Duration;

/// Top-level error type for the taskmux library.
#[derive(Debug, thiserror::Error)]
pub enum TaskmuxError {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Event log error: {0}")]
    Log(#[from] LogError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from task lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task '{task_id}' does not exist for agent '{agent}'")]
    AgentOwnership { task_id: String, agent: String },

    #[error("Invalid {field}: {message}")]
    InvalidTask { field: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("Task '{task_id}' is locked: {reason}")]
    LockUnavailable { task_id: String, reason: String },

    #[error("Task '{task_id}' is already in terminal state '{status}'")]
    TerminalState { task_id: String, status: String },

    #[error("Current task selection failed: {0}")]
    Selection(#[source] anyhow::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Shorthand for an `InvalidTask` error on a named field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::InvalidTask {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors from lock file I/O.
///
/// Contention is not an error: it is reported through
/// [`LockAcquisition`](crate::lock::LockAcquisition).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize lock record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Lock scan failed: {0}")]
    Scan(String),
}

/// Errors from the durable operation log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {0:?} waiting for the write queue to drain")]
    Timeout(Duration),

    #[error("Log writer has shut down")]
    WriterClosed,
}

/// Errors from loading engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
