//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Build a handle without installing it globally (tests, embedding).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused because the connection limit was reached (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// WebSocket connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound frames dropped on a full or closed channel (counter).
pub const WS_DELIVERY_DROPS_TOTAL: &str = "ws_delivery_drops_total";
/// Inbound events accepted (counter, labels: event).
pub const RELAY_EVENTS_TOTAL: &str = "relay_events_total";
/// Inbound frames rejected (counter, labels: code).
pub const RELAY_REJECTED_TOTAL: &str = "relay_rejected_total";
/// Outbound frames queued to recipients (counter, labels: event).
pub const RELAY_DELIVERIES_TOTAL: &str = "relay_deliveries_total";
/// Private events addressed to an offline user (counter).
pub const RELAY_OFFLINE_DROPS_TOTAL: &str = "relay_offline_drops_total";
/// Presence transitions (counter, labels: status).
pub const PRESENCE_CHANGES_TOTAL: &str = "presence_changes_total";
/// Registered users (gauge).
pub const PRESENCE_ONLINE_USERS: &str = "presence_online_users";
/// Stale connections replaced by a newer registration (counter).
pub const PRESENCE_SUPERSEDED_TOTAL: &str = "presence_superseded_total";
/// Group membership lookups that failed or timed out (counter).
pub const MEMBERSHIP_FAILURES_TOTAL: &str = "membership_failures_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let handle = detached_handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_CONNECTION_DURATION_SECONDS,
            WS_DELIVERY_DROPS_TOTAL,
            RELAY_EVENTS_TOTAL,
            RELAY_REJECTED_TOTAL,
            RELAY_DELIVERIES_TOTAL,
            RELAY_OFFLINE_DROPS_TOTAL,
            PRESENCE_CHANGES_TOTAL,
            PRESENCE_ONLINE_USERS,
            PRESENCE_SUPERSEDED_TOTAL,
            MEMBERSHIP_FAILURES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
