//! Health check HTTP server
//!
//! Exposes the console's link state, presence table and metrics for
//! operators and container orchestration.

use crate::console::Console;
use crate::presence::AgentPresence;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::Filter;
use warp::http::StatusCode;

/// HTTP health check server
pub struct HealthServer {
    console: Arc<Console>,
    port: u16,
}

impl HealthServer {
    pub fn new(console: Arc<Console>, port: u16) -> Self {
        Self { console, port }
    }

    /// Serve until the task is dropped
    pub async fn start(self) {
        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes(self.console))
            .run(([0, 0, 0, 0], self.port))
            .await;
    }
}

/// Every endpoint, without binding a socket
pub fn routes(
    console: Arc<Console>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_console = warp::any().map(move || Arc::clone(&console));

    // GET /health - overall status with per-component checks
    let health_route = warp::path("health")
        .and(warp::get())
        .and(with_console.clone())
        .and_then(|console: Arc<Console>| async move {
            let status = health_status(&console);
            let code = if status.status == "healthy" {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
        });

    // GET /ready - readiness probe, ready once the broker link is up
    let ready_route = warp::path("ready")
        .and(warp::get())
        .and(with_console.clone())
        .and_then(|console: Arc<Console>| async move {
            let ready = console.connection_state().connected;
            let response = ReadinessResponse {
                ready,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
        });

    // GET /live - liveness probe
    let live_route = warp::path("live").and(warp::get()).and_then(|| async move {
        let response = LivenessResponse {
            alive: true,
            timestamp: current_timestamp(),
        };
        Ok::<_, Infallible>(warp::reply::json(&response))
    });

    // GET /presence - agent table sorted by id
    let presence_route = warp::path("presence")
        .and(warp::get())
        .and(with_console.clone())
        .and_then(|console: Arc<Console>| async move {
            let agents: BTreeMap<String, AgentPresence> =
                console.presence_snapshot().into_iter().collect();
            Ok::<_, Infallible>(warp::reply::json(&agents))
        });

    // GET /metrics
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(with_console)
        .and_then(|console: Arc<Console>| async move {
            Ok::<_, Infallible>(warp::reply::json(&console.metrics()))
        });

    health_route
        .or(ready_route)
        .or(live_route)
        .or(presence_route)
        .or(metrics_route)
}

fn health_status(console: &Console) -> HealthStatus {
    let now = current_timestamp();
    let connection = console.connection_state();
    let metrics = console.metrics();

    let mut checks = BTreeMap::new();
    checks.insert(
        "mqtt".to_string(),
        if connection.connected {
            HealthCheck::healthy("MQTT connection established", now)
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some(match connection.error {
                    Some(error) => format!(
                        "Disconnected ({error}), reconnect attempt {}",
                        connection.reconnect_count
                    ),
                    None => "MQTT connection not established".to_string(),
                }),
                last_check: now,
            }
        },
    );
    checks.insert(
        "commands".to_string(),
        HealthCheck::healthy(
            &format!("{} pending, {} timed out", metrics.commands.pending, metrics.commands.timed_out),
            now,
        ),
    );

    let overall_healthy = checks.values().all(|check| check.status == "healthy");

    HealthStatus {
        status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: now,
        client_id: console.client_id().to_string(),
        uptime_seconds: metrics.uptime_seconds,
        agents_online: metrics.agents_online,
        checks,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: &str, now: u64) -> Self {
        Self {
            status: "healthy".to_string(),
            message: Some(message.to_string()),
            last_check: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    client_id: String,
    uptime_seconds: u64,
    agents_online: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
