// ABOUTME: Tests for the connection registry.
// ABOUTME: Covers registration, lookup, activity stamping, and stale sweeps.

use std::time::Duration;

use chrono::Utc;

use super::manager::{Connection, ConnectionManager};
use crate::config::is_stale;

#[tokio::test]
async fn test_register_stamps_last_activity() {
    let manager = ConnectionManager::new();
    let before = Utc::now();

    manager.register(Connection::new("conn-1", "agent-a")).await;

    let connection = manager.get_connection("conn-1").await.unwrap();
    assert_eq!(connection.agent, "agent-a");
    assert!(connection.last_activity.unwrap() >= before);
}

#[tokio::test]
async fn test_register_overwrites_same_id() {
    let manager = ConnectionManager::new();
    manager.register(Connection::new("conn-1", "agent-a")).await;
    manager.register(Connection::new("conn-1", "agent-b")).await;

    let connection = manager.get_connection("conn-1").await.unwrap();
    assert_eq!(connection.agent, "agent-b");
    assert_eq!(manager.get_active_connections().await.len(), 1);
}

#[tokio::test]
async fn test_unregister_reports_presence() {
    let manager = ConnectionManager::new();
    manager.register(Connection::new("conn-1", "agent-a")).await;

    assert!(manager.unregister("conn-1").await);
    assert!(!manager.unregister("conn-1").await);
    assert!(manager.get_connection("conn-1").await.is_none());
}

#[tokio::test]
async fn test_update_activity_missing_is_noop() {
    let manager = ConnectionManager::new();
    manager.update_activity("ghost").await;
    assert!(manager.get_active_connections().await.is_empty());
}

#[tokio::test]
async fn test_update_activity_advances_timestamp() {
    let manager = ConnectionManager::new();
    manager.register(Connection::new("conn-1", "agent-a")).await;
    let first = manager
        .get_connection("conn-1")
        .await
        .unwrap()
        .last_activity
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.update_activity("conn-1").await;

    let second = manager
        .get_connection("conn-1")
        .await
        .unwrap()
        .last_activity
        .unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn test_connections_by_agent_is_case_sensitive() {
    let manager = ConnectionManager::new();
    manager.register(Connection::new("c1", "Agent")).await;
    manager.register(Connection::new("c2", "agent")).await;
    manager.register(Connection::new("c3", "agent")).await;

    assert_eq!(manager.get_connections_by_agent("agent").await.len(), 2);
    assert_eq!(manager.get_connections_by_agent("Agent").await.len(), 1);
    assert!(manager.get_connections_by_agent("AGENT").await.is_empty());
}

#[tokio::test]
async fn test_cleanup_removes_idle_connections() {
    let manager = ConnectionManager::with_stale_after(Duration::from_millis(20));
    manager.register(Connection::new("old", "agent-a")).await;

    tokio::time::sleep(Duration::from_millis(40)).await;
    manager.register(Connection::new("fresh", "agent-b")).await;

    let removed = manager.cleanup_stale_connections().await;
    assert_eq!(removed, 1);
    assert!(manager.get_connection("old").await.is_none());
    assert!(manager.get_connection("fresh").await.is_some());
}

#[tokio::test]
async fn test_cleanup_keeps_everything_within_window() {
    let manager = ConnectionManager::new();
    manager.register(Connection::new("c1", "agent-a")).await;
    assert_eq!(manager.cleanup_stale_connections().await, 0);
}

#[test]
fn test_last_seen_falls_back_to_start_time() {
    let connection = Connection::new("c1", "agent-a");
    assert_eq!(connection.last_seen(), connection.start_time);
}

#[test]
fn test_is_stale_boundaries() {
    let now = Utc::now();
    let hour = Duration::from_secs(3600);

    assert!(is_stale(now, now - chrono::Duration::minutes(61), hour));
    assert!(!is_stale(now, now - chrono::Duration::minutes(59), hour));
    assert!(!is_stale(now, now + chrono::Duration::minutes(5), hour));
}

#[tokio::test]
async fn test_statistics() {
    let manager = ConnectionManager::new();
    assert_eq!(manager.get_statistics().await.total_connections, 0);

    manager.register(Connection::new("c1", "agent-a")).await;
    manager.register(Connection::new("c2", "agent-a")).await;
    manager.register(Connection::new("c3", "agent-b")).await;

    let stats = manager.get_statistics().await;
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.unique_agents, 2);
    assert_eq!(stats.connections_by_agent["agent-a"], 2);
    assert_eq!(stats.connections_by_agent["agent-b"], 1);
}

#[test]
fn test_task_id_metadata() {
    let connection = Connection::new("c1", "agent-a").with_metadata("taskId", "T1");
    assert_eq!(connection.task_id(), Some("T1"));

    let empty = Connection::new("c2", "agent-a").with_metadata("taskId", "");
    assert_eq!(empty.task_id(), None);
}
