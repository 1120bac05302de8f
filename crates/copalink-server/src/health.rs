//! `/` status and `/health` endpoint bodies.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Number of registered users.
    pub online_users: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, online_users: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        online_users,
    }
}

/// Body of `GET /`, kept for clients that poll the relay's root.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Always `"online"`.
    pub status: String,
    /// Human-readable banner.
    pub message: String,
    /// Registered users.
    pub connected_users: usize,
}

/// Build the root status body.
pub fn status(connected_users: usize) -> StatusResponse {
    StatusResponse {
        status: "online".into(),
        message: "CopaLink relay is running".into(),
        connected_users,
    }
}
