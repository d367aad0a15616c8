// ABOUTME: Connection module - ephemeral registry of agent sessions.
// ABOUTME: Resolves which agent is behind a session and sweeps idle ones.

mod manager;

pub use manager::{Connection, ConnectionManager, ConnectionStatistics};

#[cfg(test)]
mod manager_test;
