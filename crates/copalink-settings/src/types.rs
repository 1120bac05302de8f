//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs to name the values it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Network and session settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Group membership resolution.
    pub membership: MembershipSettings,
}

impl RelaySettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be at least 1".into(),
            ));
        }
        if server.heartbeat_timeout_secs < server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutSecs ({}) is shorter than the interval ({})",
                server.heartbeat_timeout_secs, server.heartbeat_interval_secs
            )));
        }
        if server.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundBuffer must be at least 1".into(),
            ));
        }
        if self.membership.mode == MembershipMode::Http && self.membership.url.is_none() {
            return Err(SettingsError::InvalidValue(
                "membership.url is required when membership.mode is \"http\"".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without any client activity before the session is closed.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth; pushes beyond it are dropped.
    pub outbound_buffer: usize,
    /// Close a stale connection when its user registers a newer one.
    pub close_superseded: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_connections: 1024,
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            max_message_size: 1024 * 1024,
            outbound_buffer: 256,
            close_superseded: true,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// `"compact"` or `"json"`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

/// How group topics are resolved to members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipMode {
    /// Every group reaches every live connection.
    #[default]
    Unscoped,
    /// Members come from [`MembershipSettings::groups`].
    Static,
    /// Members are fetched from the REST layer at [`MembershipSettings::url`].
    Http,
}

/// Group membership settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MembershipSettings {
    /// Resolution strategy.
    pub mode: MembershipMode,
    /// Static membership: group id (as a string key) → member user ids.
    pub groups: BTreeMap<String, Vec<i64>>,
    /// URL template for HTTP mode; `{group_id}` is substituted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Lookup timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self {
            mode: MembershipMode::Unscoped,
            groups: BTreeMap::new(),
            url: None,
            timeout_ms: 2_000,
        }
    }
}

impl MembershipSettings {
    /// Static groups with parsed integer keys. Non-numeric keys are skipped.
    pub fn parsed_groups(&self) -> Vec<(i64, Vec<i64>)> {
        self.groups
            .iter()
            .filter_map(|(key, members)| match key.parse::<i64>() {
                Ok(id) => Some((id, members.clone())),
                Err(_) => {
                    tracing::warn!(key, "ignoring non-numeric group id in membership.groups");
                    None
                }
            })
            .collect()
    }
}
