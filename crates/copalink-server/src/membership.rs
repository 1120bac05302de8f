//! Group membership resolution.
//!
//! The router never decides who belongs to a group itself; it asks an
//! injected [`GroupMembership`]. Three strategies ship:
//!
//! - [`UnscopedMembership`]: every group reaches every live connection
//! - [`StaticMembership`]: fixed map from settings
//! - [`HttpMembership`]: fetched from the REST layer per lookup

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use copalink_core::{GroupId, UserId};
use copalink_settings::{MembershipMode, MembershipSettings};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Membership lookup failures.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The lookup did not finish in time.
    #[error("membership lookup for group {group} timed out after {timeout:?}")]
    Timeout {
        /// Group being resolved.
        group: GroupId,
        /// Configured limit.
        timeout: Duration,
    },
    /// Transport-level failure.
    #[error("membership request failed: {0}")]
    Request(String),
    /// Non-success HTTP status.
    #[error("membership endpoint returned HTTP {0}")]
    Status(u16),
    /// Body was not a recognised member list.
    #[error("unrecognised membership response: {0}")]
    Decode(String),
    /// Invalid configuration.
    #[error("membership configuration: {0}")]
    Config(String),
}

/// Who a group-scoped event reaches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Every live connection.
    Everyone,
    /// Only these users (possibly none).
    Members(HashSet<UserId>),
}

/// Resolves a group to its audience.
#[async_trait]
pub trait GroupMembership: Send + Sync {
    /// Audience for `group`.
    async fn audience(&self, group: GroupId) -> Result<Audience, MembershipError>;

    /// Strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Every group resolves to everyone.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnscopedMembership;

#[async_trait]
impl GroupMembership for UnscopedMembership {
    async fn audience(&self, _group: GroupId) -> Result<Audience, MembershipError> {
        Ok(Audience::Everyone)
    }

    fn name(&self) -> &'static str {
        "unscoped"
    }
}

/// Fixed group → members map. Unknown groups have no members.
#[derive(Clone, Debug, Default)]
pub struct StaticMembership {
    groups: HashMap<GroupId, HashSet<UserId>>,
}

impl StaticMembership {
    /// Build from `(group, members)` pairs.
    pub fn new(groups: impl IntoIterator<Item = (i64, Vec<i64>)>) -> Self {
        let groups = groups
            .into_iter()
            .map(|(group, members)| {
                (
                    GroupId(group),
                    members.into_iter().map(UserId).collect::<HashSet<_>>(),
                )
            })
            .collect();
        Self { groups }
    }
}

#[async_trait]
impl GroupMembership for StaticMembership {
    async fn audience(&self, group: GroupId) -> Result<Audience, MembershipError> {
        Ok(Audience::Members(
            self.groups.get(&group).cloned().unwrap_or_default(),
        ))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Members fetched from the REST layer.
///
/// `url_template` contains `{group_id}`. Accepted bodies are a bare array of
/// ids, or `{"success": true, "data": [...]}` whose items are ids or objects
/// with an `id`.
pub struct HttpMembership {
    client: reqwest::Client,
    url_template: String,
    timeout: Duration,
}

impl HttpMembership {
    /// Create a client for `url_template` with a per-lookup timeout.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, MembershipError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("copalink-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MembershipError::Config(e.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            timeout,
        })
    }

    fn url_for(&self, group: GroupId) -> String {
        self.url_template.replace("{group_id}", &group.to_string())
    }

    async fn fetch(&self, url: &str) -> Result<HashSet<UserId>, MembershipError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MembershipError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MembershipError::Status(status.as_u16()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| MembershipError::Decode(e.to_string()))?;
        parse_members(&body)
    }
}

#[async_trait]
impl GroupMembership for HttpMembership {
    async fn audience(&self, group: GroupId) -> Result<Audience, MembershipError> {
        let url = self.url_for(group);
        debug!(group_id = %group, %url, "fetching group members");
        match tokio::time::timeout(self.timeout, self.fetch(&url)).await {
            Ok(members) => members.map(Audience::Members),
            Err(_) => Err(MembershipError::Timeout {
                group,
                timeout: self.timeout,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Parse a member list body.
pub fn parse_members(body: &Value) -> Result<HashSet<UserId>, MembershipError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => {
            if map.get("success").and_then(Value::as_bool) == Some(false) {
                return Err(MembershipError::Decode("endpoint reported failure".into()));
            }
            match map.get("data") {
                Some(Value::Array(items)) => items,
                _ => return Err(MembershipError::Decode("missing \"data\" array".into())),
            }
        }
        other => {
            return Err(MembershipError::Decode(format!(
                "expected array or object, got {other}"
            )));
        }
    };

    items
        .iter()
        .map(|item| {
            item.as_i64()
                .or_else(|| item.get("id").and_then(Value::as_i64))
                .map(UserId)
                .ok_or_else(|| MembershipError::Decode(format!("not a member id: {item}")))
        })
        .collect()
}

/// Build the configured membership strategy.
pub fn from_settings(
    settings: &MembershipSettings,
) -> Result<Arc<dyn GroupMembership>, MembershipError> {
    let membership: Arc<dyn GroupMembership> = match settings.mode {
        MembershipMode::Unscoped => Arc::new(UnscopedMembership),
        MembershipMode::Static => Arc::new(StaticMembership::new(settings.parsed_groups())),
        MembershipMode::Http => {
            let url = settings
                .url
                .clone()
                .ok_or_else(|| MembershipError::Config("membership.url is not set".into()))?;
            Arc::new(HttpMembership::new(
                url,
                Duration::from_millis(settings.timeout_ms),
            )?)
        }
    };
    Ok(membership)
}
