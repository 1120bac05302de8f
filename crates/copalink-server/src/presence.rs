//! Presence tracking.
//!
//! Every registry mutation that binds or unbinds an identity goes through
//! [`PresenceTracker`]. The matching `user_status_change` frames are queued
//! by the registry under its write lock, so concurrent connects and
//! disconnects reach every client in the order they were applied.

use std::sync::Arc;

use copalink_core::{ConnectionId, PresenceStatus, ServerEvent, UserIdentity};
use metrics::{counter, gauge};
use tracing::{debug, info};

use crate::metrics::{PRESENCE_CHANGES_TOTAL, PRESENCE_ONLINE_USERS, PRESENCE_SUPERSEDED_TOTAL};
use crate::registry::{ConnectionRegistry, RegistryError};

/// Derives online/offline fan-out from registry mutations.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    close_superseded: bool,
}

impl PresenceTracker {
    /// Wrap a registry. `close_superseded` closes a user's stale connection
    /// when they register a newer one.
    pub fn new(registry: Arc<ConnectionRegistry>, close_superseded: bool) -> Self {
        Self {
            registry,
            close_superseded,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register `identity` on `connection_id` and announce it.
    ///
    /// Emits "offline" for an identity this connection displaces, then one
    /// "online" (also on re-registration). Fails without emitting anything
    /// when the connection is no longer attached.
    pub fn announce(
        &self,
        connection_id: &ConnectionId,
        identity: UserIdentity,
    ) -> Result<(), RegistryError> {
        let registration = self
            .registry
            .register_and_publish(connection_id, identity.clone())?;

        if registration.displaced.is_some() {
            self.record(PresenceStatus::Offline);
        }

        if let Some(stale) = registration.superseded {
            counter!(PRESENCE_SUPERSEDED_TOTAL).increment(1);
            info!(
                user_id = %identity.id,
                stale_conn = %stale.id,
                conn_id = %connection_id,
                close = self.close_superseded,
                "connection superseded"
            );
            if self.close_superseded {
                let _ = stale.send_event(&ServerEvent::SessionSuperseded {
                    connection_id: connection_id.clone(),
                });
                stale.close();
            }
        }

        self.record(PresenceStatus::Online);
        debug!(user_id = %identity.id, username = %identity.username, "user online");
        Ok(())
    }

    /// Detach a closed connection, announcing "offline" if it carried an
    /// identity. Returns that identity.
    pub fn depart(&self, connection_id: &ConnectionId) -> Option<UserIdentity> {
        let identity = self.registry.disconnect_and_publish(connection_id)?;
        self.record(PresenceStatus::Offline);
        debug!(user_id = %identity.id, conn_id = %connection_id, "user offline");
        Some(identity)
    }

    fn record(&self, status: PresenceStatus) {
        counter!(PRESENCE_CHANGES_TOTAL, "status" => status.as_str()).increment(1);
        #[allow(clippy::cast_precision_loss)]
        gauge!(PRESENCE_ONLINE_USERS).set(self.registry.online_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{identity, make_connection};
    use copalink_core::UserId;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn statuses(frames: &[Value]) -> Vec<(i64, String)> {
        frames
            .iter()
            .filter(|f| f["event"] == "user_status_change")
            .map(|f| {
                (
                    f["data"]["userId"].as_i64().unwrap(),
                    f["data"]["status"].as_str().unwrap().to_owned(),
                )
            })
            .collect()
    }

    fn tracker(close_superseded: bool) -> PresenceTracker {
        PresenceTracker::new(Arc::new(ConnectionRegistry::new()), close_superseded)
    }

    #[test]
    fn announce_broadcasts_online_to_everyone() {
        let presence = tracker(true);
        let (a, mut rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        presence.registry().attach(a);
        presence.registry().attach(b);

        presence.announce(&"a".into(), identity(1, "ana")).unwrap();

        assert_eq!(statuses(&drain(&mut rx_a)), vec![(1, "online".to_owned())]);
        let frames = drain(&mut rx_b);
        assert_eq!(statuses(&frames), vec![(1, "online".to_owned())]);
        assert_eq!(frames[0]["data"]["username"], "ana");
    }

    #[test]
    fn announce_unknown_connection_emits_nothing() {
        let presence = tracker(true);
        let (b, mut rx_b) = make_connection("b");
        presence.registry().attach(b);

        let err = presence.announce(&"gone".into(), identity(1, "ana"));
        assert_eq!(err, Err(RegistryError::UnknownConnection("gone".into())));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn reannounce_emits_online_twice() {
        let presence = tracker(true);
        let (a, mut rx_a) = make_connection("a");
        presence.registry().attach(a);

        presence.announce(&"a".into(), identity(1, "ana")).unwrap();
        presence.announce(&"a".into(), identity(1, "ana")).unwrap();

        assert_eq!(
            statuses(&drain(&mut rx_a)),
            vec![(1, "online".to_owned()), (1, "online".to_owned())]
        );
        assert_eq!(presence.registry().online_count(), 1);
    }

    #[test]
    fn depart_broadcasts_offline_once() {
        let presence = tracker(true);
        let (a, _rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        presence.registry().attach(a);
        presence.registry().attach(b);
        presence.announce(&"a".into(), identity(1, "ana")).unwrap();
        presence.announce(&"b".into(), identity(2, "leo")).unwrap();
        let _ = drain(&mut rx_b);

        assert_eq!(presence.depart(&"a".into()), Some(identity(1, "ana")));
        assert!(presence.depart(&"a".into()).is_none());

        assert_eq!(statuses(&drain(&mut rx_b)), vec![(1, "offline".to_owned())]);
        assert!(presence.registry().resolve_connection(UserId(1)).is_none());
    }

    #[test]
    fn depart_anonymous_connection_is_silent() {
        let presence = tracker(true);
        let (a, _rx_a) = make_connection("a");
        let (b, mut rx_b) = make_connection("b");
        presence.registry().attach(a);
        presence.registry().attach(b);

        assert!(presence.depart(&"a".into()).is_none());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(presence.registry().connection_count(), 1);
    }

    #[test]
    fn displaced_identity_goes_offline_before_new_online() {
        let presence = tracker(true);
        let (a, mut rx_a) = make_connection("a");
        presence.registry().attach(a);
        presence.announce(&"a".into(), identity(1, "ana")).unwrap();
        let _ = drain(&mut rx_a);

        presence.announce(&"a".into(), identity(2, "leo")).unwrap();
        assert_eq!(
            statuses(&drain(&mut rx_a)),
            vec![(1, "offline".to_owned()), (2, "online".to_owned())]
        );
    }

    #[test]
    fn superseded_connection_is_told_and_closed() {
        let presence = tracker(true);
        let (old, mut rx_old) = make_connection("old");
        let (new, _rx_new) = make_connection("new");
        presence.registry().attach(old.clone());
        presence.registry().attach(new);
        presence.announce(&"old".into(), identity(1, "ana")).unwrap();
        let _ = drain(&mut rx_old);

        presence.announce(&"new".into(), identity(1, "ana")).unwrap();

        let frames = drain(&mut rx_old);
        let notice = frames
            .iter()
            .find(|f| f["event"] == "session_superseded")
            .unwrap();
        assert_eq!(notice["data"]["connectionId"], "new");
        assert!(old.is_closing());

        // The stale session closing later stays silent.
        assert!(presence.depart(&"old".into()).is_none());
        assert_eq!(
            presence.registry().resolve_connection(UserId(1)),
            Some("new".into())
        );
    }

    #[test]
    fn superseded_connection_kept_open_when_disabled() {
        let presence = tracker(false);
        let (old, mut rx_old) = make_connection("old");
        let (new, _rx_new) = make_connection("new");
        presence.registry().attach(old.clone());
        presence.registry().attach(new);
        presence.announce(&"old".into(), identity(1, "ana")).unwrap();
        presence.announce(&"new".into(), identity(1, "ana")).unwrap();

        assert!(!old.is_closing());
        assert!(
            drain(&mut rx_old)
                .iter()
                .all(|f| f["event"] != "session_superseded")
        );
    }

    #[test]
    fn concurrent_depart_and_announce_agree_with_registry() {
        for round in 0..500 {
            let presence = tracker(true);
            let (watcher, mut rx) = make_connection("watcher");
            let (a, _rx_a) = make_connection("a");
            let (b, _rx_b) = make_connection("b");
            presence.registry().attach(watcher);
            presence.registry().attach(a);
            presence.registry().attach(b);
            presence.announce(&"a".into(), identity(1, "ana")).unwrap();
            let _ = drain(&mut rx);

            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|s| {
                let _ = s.spawn(|| {
                    let _ = barrier.wait();
                    let _ = presence.depart(&"a".into());
                });
                let _ = s.spawn(|| {
                    let _ = barrier.wait();
                    presence.announce(&"b".into(), identity(1, "ana")).unwrap();
                });
            });

            let last = statuses(&drain(&mut rx))
                .into_iter()
                .filter(|(user, _)| *user == 1)
                .last()
                .map(|(_, status)| status);
            let online = presence.registry().resolve_connection(UserId(1)).is_some();
            assert!(online, "round {round}: user 1 should be registered on b");
            assert_eq!(last.as_deref(), Some("online"), "round {round}");
        }
    }
}
