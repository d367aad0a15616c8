// ABOUTME: Defines the EventLogEntry record plus replay filters and the
// ABOUTME: summary shapes (statistics, archive report, log info) built from it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub success: bool,
    /// Wall time of the operation in milliseconds.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventLogEntry {
    /// Create a successful entry stamped now.
    pub fn new(operation: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            agent: agent.into(),
            task_id: None,
            success: true,
            duration: 0,
            metadata: None,
            error: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Add a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata
                .get_or_insert_with(serde_json::Map::new)
                .insert(key.into(), v);
        }
        self
    }

    /// Mark the entry as failed with an error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Criteria for replaying the log. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub operation: Option<String>,
    pub agent: Option<String>,
    pub task_id: Option<String>,
    /// Only entries at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// Whether `entry` satisfies every set criterion.
    pub fn matches(&self, entry: &EventLogEntry) -> bool {
        self.operation.as_ref().is_none_or(|op| *op == entry.operation)
            && self.agent.as_ref().is_none_or(|agent| *agent == entry.agent)
            && self
                .task_id
                .as_ref()
                .is_none_or(|id| entry.task_id.as_deref() == Some(id.as_str()))
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self.success.is_none_or(|success| entry.success == success)
    }
}

/// Aggregate counts for one slice of the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBreakdown {
    pub count: usize,
    pub success_count: usize,
    /// Fraction of successful entries in `[0, 1]`.
    pub success_rate: f64,
    /// Mean duration in milliseconds.
    pub average_duration: f64,
    #[serde(skip)]
    total_duration: u64,
}

impl OperationBreakdown {
    fn add(&mut self, entry: &EventLogEntry) {
        self.count += 1;
        if entry.success {
            self.success_count += 1;
        }
        self.total_duration = self.total_duration.saturating_add(entry.duration);
    }

    fn finish(&mut self) {
        if self.count > 0 {
            self.success_rate = self.success_count as f64 / self.count as f64;
            self.average_duration = self.total_duration as f64 / self.count as f64;
        }
    }
}

/// Aggregates over the whole log, globally and grouped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatistics {
    pub total_operations: usize,
    pub success_rate: f64,
    pub average_duration: f64,
    pub by_operation: BTreeMap<String, OperationBreakdown>,
    pub by_agent: BTreeMap<String, OperationBreakdown>,
}

impl OperationStatistics {
    /// Build statistics from replayed entries. Empty input yields all zeros.
    pub fn from_entries(entries: &[EventLogEntry]) -> Self {
        let mut overall = OperationBreakdown::default();
        let mut by_operation: BTreeMap<String, OperationBreakdown> = BTreeMap::new();
        let mut by_agent: BTreeMap<String, OperationBreakdown> = BTreeMap::new();

        for entry in entries {
            overall.add(entry);
            by_operation
                .entry(entry.operation.clone())
                .or_default()
                .add(entry);
            by_agent.entry(entry.agent.clone()).or_default().add(entry);
        }

        overall.finish();
        by_operation.values_mut().for_each(OperationBreakdown::finish);
        by_agent.values_mut().for_each(OperationBreakdown::finish);

        Self {
            total_operations: overall.count,
            success_rate: overall.success_rate,
            average_duration: overall.average_duration,
            by_operation,
            by_agent,
        }
    }
}

/// Result of moving old entries out of the live log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    pub archived_count: usize,
    /// `None` when nothing was old enough to archive.
    pub archive_file: Option<PathBuf>,
}

/// Size and time span of the live log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInfo {
    pub size_bytes: u64,
    pub entry_count: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}
