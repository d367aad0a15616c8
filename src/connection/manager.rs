// ABOUTME: Implements the ConnectionManager - a thread-safe map from session
// ABOUTME: ids to agent identities with activity tracking and staleness sweeps.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{DEFAULT_CONNECTION_STALE_AFTER, is_stale};

/// An ephemeral session between one agent and the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub agent: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl Connection {
    /// Create a connection for `agent` starting now.
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            start_time: Utc::now(),
            metadata: HashMap::new(),
            last_activity: None,
        }
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    /// Explicit task id carried in the `taskId` metadata key, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.metadata
            .get("taskId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Last time this connection was seen: `last_activity`, else `start_time`.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_activity.unwrap_or(self.start_time)
    }
}

/// Aggregate counts over the registered connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatistics {
    pub total_connections: usize,
    pub unique_agents: usize,
    pub connections_by_agent: BTreeMap<String, usize>,
}

/// A thread-safe registry of live agent connections.
///
/// Nothing is persisted; entries live until [`unregister`](Self::unregister)
/// or until a [`cleanup_stale_connections`](Self::cleanup_stale_connections)
/// sweep finds them idle past the staleness window.
#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    stale_after: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Create a registry with the default one hour staleness window.
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_CONNECTION_STALE_AFTER)
    }

    /// Create a registry with a custom staleness window.
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            stale_after,
        }
    }

    /// Register a connection, replacing any existing entry with the same id.
    pub async fn register(&self, mut connection: Connection) {
        connection.last_activity = Some(Utc::now());
        tracing::debug!(
            connection = %connection.id,
            agent = %connection.agent,
            "registered connection"
        );
        let mut connections = self.connections.write().await;
        connections.insert(connection.id.clone(), connection);
    }

    /// Get a connection by id.
    pub async fn get_connection(&self, id: &str) -> Option<Connection> {
        let connections = self.connections.read().await;
        connections.get(id).cloned()
    }

    /// Remove a connection. Returns true if it was present.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(id).is_some()
    }

    /// Stamp a connection's `last_activity` with the current time.
    pub async fn update_activity(&self, id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(id) {
            connection.last_activity = Some(Utc::now());
        }
    }

    /// All registered connections.
    pub async fn get_active_connections(&self) -> Vec<Connection> {
        let connections = self.connections.read().await;
        connections.values().cloned().collect()
    }

    /// Connections belonging to `agent` (exact, case-sensitive match).
    pub async fn get_connections_by_agent(&self, agent: &str) -> Vec<Connection> {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|c| c.agent == agent)
            .cloned()
            .collect()
    }

    /// Remove connections idle longer than the staleness window.
    ///
    /// Returns the number of connections removed.
    pub async fn cleanup_stale_connections(&self) -> usize {
        let now = Utc::now();
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, c| !is_stale(now, c.last_seen(), self.stale_after));
        let removed = before - connections.len();
        if removed > 0 {
            tracing::info!(removed, "swept stale connections");
        }
        removed
    }

    /// Snapshot counts of connections and agents.
    pub async fn get_statistics(&self) -> ConnectionStatistics {
        let connections = self.connections.read().await;
        let mut by_agent = BTreeMap::new();
        for connection in connections.values() {
            *by_agent.entry(connection.agent.clone()).or_insert(0) += 1;
        }

        ConnectionStatistics {
            total_connections: connections.len(),
            unique_agents: by_agent.len(),
            connections_by_agent: by_agent,
        }
    }
}
