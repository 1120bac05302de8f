//! Connection registry, the one shared map between users and live connections.
//!
//! All three views (live connections, `UserId → ConnectionId`,
//! `ConnectionId → UserIdentity`) sit in one struct behind one lock, so the
//! two directions of the identity mapping can never disagree. The lock is
//! never held across an `.await`.
//!
//! Presence frames are queued while the write lock is held, so every client
//! sees online/offline transitions in the same order the registry applied
//! them. Queueing is `try_send` and never blocks.

use std::collections::HashMap;
use std::sync::Arc;

use copalink_core::{ConnectionId, PresenceStatus, ServerEvent, UserId, UserIdentity};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::websocket::connection::{ClientConnection, SessionState};

/// Registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection closed (or was never attached) before registering.
    #[error("connection {0} is not attached")]
    UnknownConnection(ConnectionId),
    /// The connection is attached but not (or no longer) open.
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),
}

/// Side effects of a successful [`ConnectionRegistry::register`].
#[derive(Default)]
pub struct Registration {
    /// The user's previous live connection, now detached from the identity.
    pub superseded: Option<Arc<ClientConnection>>,
    /// A different identity this connection was registered as before.
    pub displaced: Option<UserIdentity>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    users: HashMap<UserId, ConnectionId>,
    identities: HashMap<ConnectionId, UserIdentity>,
}

impl Inner {
    fn register(
        &mut self,
        connection_id: &ConnectionId,
        identity: UserIdentity,
    ) -> Result<Registration, RegistryError> {
        match self.connections.get(connection_id) {
            None => return Err(RegistryError::UnknownConnection(connection_id.clone())),
            Some(conn) if conn.state() != SessionState::Open => {
                return Err(RegistryError::NotOpen(connection_id.clone()));
            }
            Some(_) => {}
        }

        let mut registration = Registration::default();

        let rebinds_other_user = self
            .identities
            .get(connection_id)
            .is_some_and(|prev| prev.id != identity.id);
        if rebinds_other_user {
            registration.displaced = self.unregister(connection_id);
        }

        let user_id = identity.id;
        if let Some(previous) = self.users.insert(user_id, connection_id.clone()) {
            if &previous != connection_id {
                let _ = self.identities.remove(&previous);
                registration.superseded = self.connections.get(&previous).cloned();
            }
        }
        let _ = self.identities.insert(connection_id.clone(), identity);

        debug!(
            conn_id = %connection_id,
            user_id = %user_id,
            superseded = registration.superseded.is_some(),
            "user registered"
        );
        Ok(registration)
    }

    fn disconnect(&mut self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        let identity = self.unregister(connection_id);
        let _ = self.connections.remove(connection_id);
        identity
    }

    fn publish(&self, identity: &UserIdentity, status: PresenceStatus) {
        let event = ServerEvent::presence(identity, status);
        let json = match event.to_frame() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                return;
            }
        };
        for conn in self.connections.values() {
            let _ = conn.send(json.clone());
        }
    }

    fn unregister(&mut self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        let identity = self.identities.remove(connection_id)?;
        if self.users.get(&identity.id) == Some(connection_id) {
            let _ = self.users.remove(&identity.id);
        }
        Some(identity)
    }
}

/// Tracks live connections and which user each one speaks for.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live connection that has not announced an identity yet.
    pub fn attach(&self, connection: Arc<ClientConnection>) {
        let mut inner = self.inner.write();
        let _ = inner.connections.insert(connection.id.clone(), connection);
    }

    /// Bind `identity` to `connection_id`, overwriting any previous binding
    /// of the same user (last registration wins). Only `Open` connections
    /// can register.
    pub fn register(
        &self,
        connection_id: &ConnectionId,
        identity: UserIdentity,
    ) -> Result<Registration, RegistryError> {
        self.inner.write().register(connection_id, identity)
    }

    /// [`register`](Self::register), then queue "offline" for a displaced
    /// identity and "online" for `identity` to every live connection, all
    /// under the same write lock.
    pub fn register_and_publish(
        &self,
        connection_id: &ConnectionId,
        identity: UserIdentity,
    ) -> Result<Registration, RegistryError> {
        let mut inner = self.inner.write();
        let registration = inner.register(connection_id, identity.clone())?;
        if let Some(displaced) = &registration.displaced {
            inner.publish(displaced, PresenceStatus::Offline);
        }
        inner.publish(&identity, PresenceStatus::Online);
        Ok(registration)
    }

    /// Remove the identity bound to `connection_id`, keeping the connection
    /// attached. Returns `None` for unknown or anonymous connections.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        self.inner.write().unregister(connection_id)
    }

    /// Unregister and detach a connection in one step.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        self.inner.write().disconnect(connection_id)
    }

    /// [`disconnect`](Self::disconnect), queueing "offline" for the removed
    /// identity under the same write lock.
    pub fn disconnect_and_publish(&self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        let mut inner = self.inner.write();
        let identity = inner.disconnect(connection_id)?;
        inner.publish(&identity, PresenceStatus::Offline);
        Some(identity)
    }

    /// Connection currently registered for `user_id`; `None` means offline.
    pub fn resolve_connection(&self, user_id: UserId) -> Option<ConnectionId> {
        self.inner.read().users.get(&user_id).cloned()
    }

    /// Live connection handle registered for `user_id`.
    pub fn resolve(&self, user_id: UserId) -> Option<Arc<ClientConnection>> {
        let inner = self.inner.read();
        let connection_id = inner.users.get(&user_id)?;
        inner.connections.get(connection_id).cloned()
    }

    /// Live connection handle by id.
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.read().connections.get(connection_id).cloned()
    }

    /// Identity bound to a connection.
    pub fn identity(&self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        self.inner.read().identities.get(connection_id).cloned()
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.read().connections.values().cloned().collect()
    }

    /// Number of live connections (announced or not).
    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Number of registered users.
    pub fn online_count(&self) -> usize {
        self.inner.read().users.len()
    }

    /// Push `event` to every live connection except `except`.
    ///
    /// Serializes once. Returns the number of connections that accepted the
    /// frame; full or closed peers are skipped.
    pub fn broadcast(&self, event: &ServerEvent, except: Option<&ConnectionId>) -> usize {
        let json = match event.to_frame() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                return 0;
            }
        };
        let targets = self.connections();
        let mut delivered = 0;
        for conn in targets.iter().filter(|c| Some(&c.id) != except) {
            if conn.send(json.clone()) {
                delivered += 1;
            } else {
                debug!(conn_id = %conn.id, event = event.name(), "broadcast dropped for client");
            }
        }
        debug!(event = event.name(), recipients = delivered, "broadcast event");
        delivered
    }
}
