//! Request/response correlation through the full console
//!
//! Commands go out through the mock transport, responses come back through
//! the dispatcher exactly as they would from the broker.


use nginx_console::{CommandEnvelope, CommandError, ResponseDisposition};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use test_helpers::{published_request_id, respond, started_console, test_config, wait_until};
use tokio::time::Instant;

#[tokio::test]
async fn test_round_trip_resolves_with_agent_payload() {
    // Arrange
    let (transport, console) = started_console(&test_config()).await;

    // Act
    let pending = console
        .dispatch(
            "agent-1",
            "reload_nginx",
            json!({}),
            Some(Duration::from_millis(5000)),
        )
        .await
        .unwrap();
    let request_id = published_request_id(&transport, "agent-1", 0);
    respond(&transport, "agent-1", &request_id, true, json!({"message": "reloaded"}));
    let response = pending.await.unwrap();

    // Assert
    assert_eq!(request_id, response.request_id);
    assert!(response.success);
    assert_eq!(response.message.as_deref(), Some("reloaded"));

    let published = transport.published_to("command/agent-1");
    let envelope: CommandEnvelope = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(envelope.command, "reload_nginx");
    assert_eq!(envelope.client_id, "console-test");
    assert!(envelope.timestamp > 0);
    assert_eq!(console.correlator().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_without_response_times_out() {
    let (_transport, console) = started_console(&test_config()).await;
    let started = Instant::now();

    let result = console
        .send(
            "agent-1",
            "reload_nginx",
            json!({}),
            Some(Duration::from_millis(5000)),
        )
        .await;

    let error = result.unwrap_err();
    assert!(error.is_timeout(), "expected timeout, got {error:?}");
    assert_eq!(error.user_message(), "no response from agent (timed out)");
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert_eq!(console.metrics().commands.timed_out, 1);
}

#[tokio::test]
async fn test_agent_failure_is_reported_verbatim() {
    let (transport, console) = started_console(&test_config()).await;

    let pending = console
        .dispatch("agent-1", "upgrade_agent", json!({"version": "2.1.0"}), None)
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();
    respond(
        &transport,
        "agent-1",
        &request_id,
        false,
        json!({"message": "package repository unreachable"}),
    );

    match pending.await {
        Err(CommandError::Rejected { message }) => {
            assert_eq!(message, "package repository unreachable")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(console.metrics().commands.rejected, 1);
}

#[tokio::test]
async fn test_concurrent_requests_to_same_agent_settle_independently() {
    // Arrange
    let (transport, console) = started_console(&test_config()).await;
    let first = console
        .dispatch("agent-1", "get_config", json!({"section": "http"}), None)
        .await
        .unwrap();
    let second = console
        .dispatch("agent-1", "get_config", json!({"section": "stream"}), None)
        .await
        .unwrap();
    assert_ne!(first.request_id(), second.request_id());

    // Act: answer out of order
    respond(&transport, "agent-1", second.request_id(), true, json!({"section": "stream"}));
    respond(&transport, "agent-1", first.request_id(), true, json!({"section": "http"}));
    let (first, second) = futures::join!(first, second);

    // Assert
    assert_eq!(first.unwrap().data["section"], json!("http"));
    assert_eq!(second.unwrap().data["section"], json!("stream"));
    // Only one SUBSCRIBE for the shared response topic
    assert_eq!(transport.subscriptions(), vec!["response/agent-1"]);
}

#[tokio::test]
async fn test_many_concurrent_sends_get_unique_request_ids() {
    let (transport, console) = started_console(&test_config()).await;

    let sends = (0..20).map(|i| {
        let console = console.clone();
        async move {
            console
                .dispatch(&format!("agent-{}", i % 4), "status", json!({}), None)
                .await
                .unwrap()
        }
    });
    let pending = futures::future::join_all(sends).await;

    let ids: HashSet<_> = pending.iter().map(|p| p.request_id().to_string()).collect();
    assert_eq!(ids.len(), 20);
    assert_eq!(console.correlator().pending_count(), 20);
    assert_eq!(console.correlator().live_agents().len(), 4);
    assert_eq!(transport.published().len(), 20);
}

#[tokio::test]
async fn test_unmatched_response_leaves_other_requests_untouched() {
    let (transport, console) = started_console(&test_config()).await;
    let pending = console
        .dispatch("agent-1", "status", json!({}), None)
        .await
        .unwrap();

    // Never issued, and from an agent we never talked to
    respond(&transport, "agent-1", "not-a-real-request", true, json!({}));
    respond(&transport, "agent-9", pending.request_id(), true, json!({}));
    wait_until(|| {
        let inbound = console.metrics().inbound;
        inbound.unmatched_responses == 1 && inbound.agent_mismatches == 1
    })
    .await;

    assert!(console.correlator().is_pending(pending.request_id()));
    respond(&transport, "agent-1", pending.request_id(), true, json!({}));
    assert!(pending.await.unwrap().success);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_dropped() {
    let (transport, console) = started_console(&test_config()).await;
    let pending = console
        .dispatch("agent-1", "status", json!({}), Some(Duration::from_millis(20)))
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    assert!(pending.await.unwrap_err().is_timeout());
    respond(&transport, "agent-1", &request_id, true, json!({}));
    wait_until(|| console.metrics().inbound.unmatched_responses == 1).await;

    assert_eq!(console.metrics().commands.succeeded, 0);
}

#[tokio::test]
async fn test_malformed_response_never_settles() {
    let (transport, console) = started_console(&test_config()).await;
    let pending = console
        .dispatch("agent-1", "status", json!({}), None)
        .await
        .unwrap();

    transport.deliver("response/agent-1", "{not json");
    transport.deliver_json("response/agent-1", &json!({"success": true}));
    wait_until(|| console.metrics().inbound.malformed == 2).await;

    assert!(console.correlator().is_pending(pending.request_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_response_and_sweep_race_settles_exactly_once() {
    let (_transport, console) = started_console(&test_config()).await;
    let correlator = console.correlator().clone();

    for _ in 0..50 {
        // Arrange
        let pending = correlator
            .dispatch("agent-1", "status", json!({}), None)
            .await
            .unwrap();
        let payload = json!({"requestId": pending.request_id(), "success": true}).to_string();
        let far_future = Instant::now() + Duration::from_secs(3600);

        // Act: response and sweep race on different worker threads
        let responder = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.handle_response("agent-1", payload.as_bytes()) })
        };
        let sweeper = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.sweep_expired(far_future) })
        };
        let disposition = responder.await.unwrap();
        let swept = sweeper.await.unwrap();
        let outcome = pending.await;

        // Assert: exactly one path won, and the caller saw that path's outcome
        match disposition {
            ResponseDisposition::Settled => {
                assert_eq!(swept, 0);
                assert!(outcome.is_ok());
            }
            ResponseDisposition::Unmatched => {
                assert_eq!(swept, 1);
                assert!(outcome.unwrap_err().is_timeout());
            }
            other => panic!("unexpected disposition {other:?}"),
        }
    }
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn test_response_before_sweep_wins() {
    let (_transport, console) = started_console(&test_config()).await;
    let correlator = console.correlator();
    let pending = correlator
        .dispatch("agent-1", "status", json!({}), None)
        .await
        .unwrap();
    let payload = json!({"requestId": pending.request_id(), "success": true}).to_string();

    assert_eq!(
        correlator.handle_response("agent-1", payload.as_bytes()),
        ResponseDisposition::Settled
    );
    assert_eq!(correlator.sweep_expired(Instant::now() + Duration::from_secs(3600)), 0);
    assert!(pending.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_response_and_timer_in_same_tick_settles_once() {
    // Arrange
    let (transport, console) = started_console(&test_config()).await;
    let correlator = console.correlator();
    let pending = correlator
        .dispatch("agent-1", "status", json!({}), Some(Duration::from_millis(500)))
        .await
        .unwrap();

    // Act: response queued, then the deadline reached before anything runs
    respond(&transport, "agent-1", pending.request_id(), true, json!({}));
    tokio::time::advance(Duration::from_millis(500)).await;
    let outcome = pending.await;

    // Assert
    assert!(outcome.unwrap().success);
    let commands = console.metrics().commands;
    assert_eq!(commands.succeeded, 1);
    assert_eq!(commands.timed_out, 0);
    assert_eq!(correlator.sweep_expired(Instant::now()), 0);
    assert_eq!(correlator.pending_count(), 0);
}
