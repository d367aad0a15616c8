// ABOUTME: Root module for taskmux - file-backed task coordination for agents.
// ABOUTME: Re-exports the engine, its collaborators, and the error taxonomy.

pub mod config;
pub mod connection;
pub mod error;
pub mod eventlog;
pub mod lock;
pub mod prelude;
pub mod task;

pub use config::EngineConfig;
pub use error::TaskmuxError;
pub use task::TaskContextManager;
