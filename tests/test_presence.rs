//! Agent presence from heartbeat and status broadcasts


use chrono::{Duration as ChronoDuration, Utc};
use nginx_console::{HeartbeatMessage, PresenceStatus, PresenceTracker, StatusMessage};
use serde_json::{json, Map};
use std::time::Duration;
use test_helpers::{started_console, test_config, wait_until};
use tokio::sync::broadcast::error::TryRecvError;

fn heartbeat(uuid: &str, attributes: serde_json::Value) -> HeartbeatMessage {
    HeartbeatMessage {
        uuid: uuid.to_string(),
        attributes: attributes.as_object().cloned().unwrap_or_else(Map::new),
    }
}

#[tokio::test]
async fn test_heartbeats_merge_with_last_write_wins() {
    // Arrange
    let (transport, console) = started_console(&test_config()).await;

    // Act
    transport.deliver_json(
        "heartbeat",
        &json!({"uuid": "agent-1", "hostname": "edge-01", "version": "1.2.0"}),
    );
    transport.deliver_json(
        "heartbeat",
        &json!({"uuid": "agent-1", "version": "1.3.0", "ip": "10.0.0.7"}),
    );
    wait_until(|| console.metrics().inbound.heartbeats == 2).await;

    // Assert
    let agent = console.presence_snapshot().remove("agent-1").unwrap();
    assert!(agent.online);
    assert!(agent.last_heartbeat.is_some());
    assert_eq!(agent.attributes["hostname"], json!("edge-01"));
    assert_eq!(agent.attributes["version"], json!("1.3.0"));
    assert_eq!(agent.attributes["ip"], json!("10.0.0.7"));
}

#[tokio::test]
async fn test_explicit_offline_overrides_recent_heartbeat() {
    let (transport, console) = started_console(&test_config()).await;
    transport.deliver_json("heartbeat", &json!({"uuid": "agent-1"}));
    wait_until(|| console.presence().get("agent-1").is_some_and(|a| a.online)).await;

    transport.deliver_json("status", &json!({"uuid": "agent-1", "status": "offline"}));
    wait_until(|| console.metrics().inbound.status_messages == 1).await;

    let agent = console.presence().get("agent-1").unwrap();
    assert!(!agent.online);
    assert_eq!(console.metrics().agents_online, 0);
}

#[tokio::test]
async fn test_snapshot_is_point_in_time_copy() {
    let (transport, console) = started_console(&test_config()).await;
    transport.deliver_json("heartbeat", &json!({"uuid": "agent-1"}));
    wait_until(|| console.presence().len() == 1).await;

    let before = console.presence_snapshot();
    transport.deliver_json("heartbeat", &json!({"uuid": "agent-2"}));
    wait_until(|| console.presence().len() == 2).await;

    assert_eq!(before.len(), 1);
    assert_eq!(console.presence_snapshot().len(), 2);
}

#[tokio::test]
async fn test_malformed_presence_messages_are_dropped() {
    let (transport, console) = started_console(&test_config()).await;

    transport.deliver("heartbeat", "not json at all");
    transport.deliver_json("heartbeat", &json!({"uuid": ""}));
    transport.deliver_json("status", &json!({"uuid": "agent-1", "status": "rebooting"}));
    // The stream keeps going after bad input
    transport.deliver_json("heartbeat", &json!({"uuid": "agent-2"}));
    wait_until(|| console.metrics().inbound.heartbeats == 1).await;

    assert_eq!(console.metrics().inbound.malformed, 3);
    assert!(console.presence().get("agent-1").is_none());
    assert!(console.presence().get("agent-2").unwrap().online);
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_heartbeats_yields_one_notification() {
    // Arrange: notify_interval_ms = 100
    let (transport, console) = started_console(&test_config()).await;
    let mut changes = console.presence_changes();

    // Act
    for i in 0..25 {
        transport.deliver_json("heartbeat", &json!({"uuid": format!("agent-{i}")}));
    }
    wait_until(|| console.metrics().inbound.heartbeats == 25).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Assert
    let change = changes.try_recv().unwrap();
    assert_eq!(change.changes, 25);
    assert_eq!(changes.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(console.metrics().agents_online, 25);
}

#[test]
fn test_liveness_window_flips_stale_agents_offline() {
    let tracker = PresenceTracker::new(Duration::from_secs(90), Duration::ZERO);
    let start = Utc::now();
    tracker.record_heartbeat_at(heartbeat("quiet", json!({})), start);
    tracker.record_heartbeat_at(heartbeat("chatty", json!({})), start);
    tracker.record_heartbeat_at(
        heartbeat("chatty", json!({})),
        start + ChronoDuration::seconds(80),
    );

    let expired = tracker.expire_stale(start + ChronoDuration::seconds(100));

    assert_eq!(expired, 1);
    assert!(!tracker.get("quiet").unwrap().online);
    assert!(tracker.get("chatty").unwrap().online);
    // Stale entries stay in the table
    assert_eq!(tracker.len(), 2);
}

#[test]
fn test_online_status_counts_as_heartbeat() {
    let tracker = PresenceTracker::new(Duration::from_secs(90), Duration::ZERO);
    let now = Utc::now();

    tracker.record_status_at(
        StatusMessage {
            uuid: "agent-1".to_string(),
            status: PresenceStatus::Online,
        },
        now,
    );

    let agent = tracker.get("agent-1").unwrap();
    assert!(agent.online);
    assert_eq!(agent.last_heartbeat, Some(now));
    assert_eq!(tracker.expire_stale(now + ChronoDuration::seconds(30)), 0);
}
