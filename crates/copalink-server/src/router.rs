//! Event router: decides who receives each inbound event.

use std::sync::Arc;

use copalink_core::{ConnectionId, GroupId, InboundEvent, ServerEvent, Target, UserId};
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::membership::{Audience, GroupMembership};
use crate::metrics::{
    MEMBERSHIP_FAILURES_TOTAL, RELAY_DELIVERIES_TOTAL, RELAY_EVENTS_TOTAL,
    RELAY_OFFLINE_DROPS_TOTAL,
};
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::websocket::connection::ClientConnection;

/// Outcome of routing one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections that accepted the relayed frame.
    pub delivered: usize,
    /// Whether a `message_sent` ack was queued for the sender.
    pub acknowledged: bool,
}

/// Routes decoded client events to their recipients.
pub struct EventRouter {
    presence: Arc<PresenceTracker>,
    membership: Arc<dyn GroupMembership>,
}

impl EventRouter {
    /// Create a router over a presence tracker and membership strategy.
    pub fn new(presence: Arc<PresenceTracker>, membership: Arc<dyn GroupMembership>) -> Self {
        Self {
            presence,
            membership,
        }
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.presence.registry()
    }

    /// Presence tracker.
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Route one event received on `origin`.
    #[instrument(skip_all, fields(conn_id = %origin.id, event = event.kind().as_str()))]
    pub async fn dispatch(
        &self,
        origin: &Arc<ClientConnection>,
        event: InboundEvent,
    ) -> DeliveryReport {
        let kind = event.kind();
        counter!(RELAY_EVENTS_TOTAL, "event" => kind.as_str()).increment(1);

        let report = match event {
            InboundEvent::UserConnected(identity) => {
                if let Err(e) = self.presence.announce(&origin.id, identity) {
                    warn!(error = %e, "registration for closed connection ignored");
                }
                DeliveryReport::default()
            }
            InboundEvent::SendMessage {
                message,
                target,
                raw,
            } => {
                let relayed = ServerEvent::NewMessage(raw);
                let delivered = match target {
                    Target::User(recipient) => self.to_user(recipient, &relayed),
                    Target::Group(group) => self.to_group(group, &relayed, None).await,
                };
                let acknowledged = origin.send_event(&ServerEvent::MessageSent {
                    success: true,
                    message_id: message.message_id,
                });
                DeliveryReport {
                    delivered,
                    acknowledged,
                }
            }
            InboundEvent::Typing { typing, target } => {
                let relayed = ServerEvent::typing(&typing, target);
                let delivered = match target {
                    Target::User(recipient) => self.to_user(recipient, &relayed),
                    Target::Group(group) => self.to_group(group, &relayed, Some(&origin.id)).await,
                };
                DeliveryReport {
                    delivered,
                    acknowledged: false,
                }
            }
            InboundEvent::TaskCreated { task, raw } => DeliveryReport {
                delivered: self.to_group(task.group_id, &ServerEvent::NewTask(raw), None).await,
                acknowledged: false,
            },
            InboundEvent::TaskUpdated { task, raw } => {
                let relayed = ServerEvent::TaskUpdate(raw);
                let delivered = match task.group_id {
                    Some(group) => self.to_group(group, &relayed, None).await,
                    None => self.registry().broadcast(&relayed, None),
                };
                DeliveryReport {
                    delivered,
                    acknowledged: false,
                }
            }
        };

        counter!(RELAY_DELIVERIES_TOTAL, "event" => kind.as_str()).increment(report.delivered as u64);
        debug!(recipients = report.delivered, "event routed");
        report
    }

    fn to_user(&self, recipient: UserId, event: &ServerEvent) -> usize {
        match self.registry().resolve(recipient) {
            Some(conn) => usize::from(conn.send_event(event)),
            None => {
                counter!(RELAY_OFFLINE_DROPS_TOTAL).increment(1);
                debug!(recipient = %recipient, event = event.name(), "recipient offline, dropped");
                0
            }
        }
    }

    async fn to_group(
        &self,
        group: GroupId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        let audience = match self.membership.audience(group).await {
            Ok(audience) => audience,
            Err(e) => {
                counter!(MEMBERSHIP_FAILURES_TOTAL).increment(1);
                warn!(
                    group_id = %group,
                    membership = self.membership.name(),
                    error = %e,
                    "membership lookup failed, group delivery dropped"
                );
                return 0;
            }
        };

        match audience {
            Audience::Everyone => self.registry().broadcast(event, except),
            Audience::Members(members) => {
                let json = match event.to_frame() {
                    Ok(j) => Arc::new(j),
                    Err(e) => {
                        warn!(event = event.name(), error = %e, "failed to serialize event");
                        return 0;
                    }
                };
                members
                    .into_iter()
                    .filter_map(|user| self.registry().resolve(user))
                    .filter(|conn| Some(&conn.id) != except)
                    .filter(|conn| conn.send(json.clone()))
                    .count()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{MembershipError, StaticMembership, UnscopedMembership};
    use crate::registry::tests::{identity, make_connection};
    use async_trait::async_trait;
    use copalink_core::UserIdentity;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    struct FailingMembership;

    #[async_trait]
    impl GroupMembership for FailingMembership {
        async fn audience(&self, _group: GroupId) -> Result<Audience, MembershipError> {
            Err(MembershipError::Status(503))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    struct Peer {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Peer {
        fn frames(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(serde_json::from_str(&frame).unwrap());
            }
            out
        }

        fn events(&mut self) -> Vec<String> {
            self.frames()
                .into_iter()
                .map(|f| f["event"].as_str().unwrap().to_owned())
                .collect()
        }
    }

    /// Router with users `1..=n` registered on connections `c1..cn`.
    fn setup(n: i64, membership: Arc<dyn GroupMembership>) -> (EventRouter, Vec<Peer>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(registry.clone(), true));
        let mut peers = Vec::new();
        for i in 1..=n {
            let (conn, rx) = make_connection(&format!("c{i}"));
            registry.attach(conn.clone());
            presence
                .announce(&conn.id, identity(i, &format!("user{i}")))
                .unwrap();
            peers.push(Peer { conn, rx });
        }
        for peer in &mut peers {
            let _ = peer.frames();
        }
        (EventRouter::new(presence, membership), peers)
    }

    fn decode(event: &str, data: Value) -> InboundEvent {
        InboundEvent::from_frame(&json!({"event": event, "data": data}).to_string()).unwrap()
    }

    fn private_message(from: i64, to: i64) -> Value {
        json!({
            "sender_id": from,
            "recipient_id": to,
            "content": "hola",
            "message_id": 77,
            "sender_name": "ana",
            "created_at": "2024-05-01T10:00:00Z",
            "extra": {"kept": [1, 2]}
        })
    }

    #[tokio::test]
    async fn private_message_reaches_only_recipient() {
        let (router, mut peers) = setup(3, Arc::new(UnscopedMembership));
        let raw = private_message(1, 2);
        let report = router
            .dispatch(&peers[0].conn, decode("send_message", raw.clone()))
            .await;
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                acknowledged: true
            }
        );

        let to_b = peers[1].frames();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["event"], "new_message");
        assert_eq!(to_b[0]["data"], raw);

        let to_a = peers[0].frames();
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["event"], "message_sent");
        assert_eq!(to_a[0]["data"], json!({"success": true, "messageId": 77}));

        assert!(peers[2].frames().is_empty());
    }

    #[tokio::test]
    async fn private_message_to_offline_recipient_still_acks() {
        let (router, mut peers) = setup(2, Arc::new(UnscopedMembership));
        let report = router
            .dispatch(&peers[0].conn, decode("send_message", private_message(1, 42)))
            .await;
        assert_eq!(report.delivered, 0);
        assert!(report.acknowledged);
        assert_eq!(peers[0].events(), vec!["message_sent"]);
        assert!(peers[1].frames().is_empty());
    }

    #[tokio::test]
    async fn group_message_unscoped_reaches_everyone_including_sender() {
        let (router, mut peers) = setup(3, Arc::new(UnscopedMembership));
        let raw = json!({"sender_id": 1, "group_id": 9, "content": "hi all", "message_id": 5});
        let report = router
            .dispatch(&peers[0].conn, decode("send_message", raw.clone()))
            .await;
        assert_eq!(report.delivered, 3);

        assert_eq!(peers[0].events(), vec!["new_message", "message_sent"]);
        for peer in &mut peers[1..] {
            let frames = peer.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["data"], raw);
        }
    }

    #[tokio::test]
    async fn group_message_static_reaches_members_only() {
        let membership = Arc::new(StaticMembership::new(vec![(9, vec![1, 3])]));
        let (router, mut peers) = setup(3, membership);
        let raw = json!({"sender_id": 1, "group_id": 9, "content": "x", "message_id": 6});
        let report = router
            .dispatch(&peers[0].conn, decode("send_message", raw))
            .await;
        assert_eq!(report.delivered, 2);
        assert_eq!(peers[0].events(), vec!["new_message", "message_sent"]);
        assert!(peers[1].frames().is_empty());
        assert_eq!(peers[2].events(), vec!["new_message"]);
    }

    #[tokio::test]
    async fn membership_failure_drops_group_delivery_but_acks() {
        let (router, mut peers) = setup(2, Arc::new(FailingMembership));
        let raw = json!({"sender_id": 1, "group_id": 9, "content": "x", "message_id": 8});
        let report = router
            .dispatch(&peers[0].conn, decode("send_message", raw))
            .await;
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 0,
                acknowledged: true
            }
        );
        assert_eq!(peers[0].events(), vec!["message_sent"]);
        assert!(peers[1].frames().is_empty());
    }

    #[tokio::test]
    async fn private_typing_reaches_only_recipient() {
        let (router, mut peers) = setup(3, Arc::new(UnscopedMembership));
        let event = decode("typing", json!({"userId": 1, "username": "ana", "recipient_id": 2}));
        let report = router.dispatch(&peers[0].conn, event).await;
        assert_eq!(report.delivered, 1);
        assert!(!report.acknowledged);

        let to_b = peers[1].frames();
        assert_eq!(to_b[0]["event"], "user_typing");
        assert_eq!(
            to_b[0]["data"],
            json!({"userId": 1, "username": "ana", "isTyping": true})
        );
        assert!(peers[0].frames().is_empty());
        assert!(peers[2].frames().is_empty());
    }

    #[tokio::test]
    async fn group_typing_skips_sender_connection() {
        let (router, mut peers) = setup(3, Arc::new(UnscopedMembership));
        let event = decode("typing", json!({"userId": 1, "username": "ana", "group_id": 9}));
        let report = router.dispatch(&peers[0].conn, event).await;
        assert_eq!(report.delivered, 2);

        assert!(peers[0].frames().is_empty());
        for peer in &mut peers[1..] {
            let frames = peer.frames();
            assert_eq!(frames[0]["data"]["groupId"], 9);
            assert_eq!(frames[0]["data"]["isTyping"], true);
        }
    }

    #[tokio::test]
    async fn task_created_reaches_group_members() {
        let membership = Arc::new(StaticMembership::new(vec![(4, vec![1, 2])]));
        let (router, mut peers) = setup(3, membership);
        let raw = json!({"group_id": 4, "task_id": 10, "title": "buy milk", "creator_name": "ana"});
        let report = router
            .dispatch(&peers[0].conn, decode("task_created", raw.clone()))
            .await;
        assert_eq!(report.delivered, 2);
        let frames = peers[0].frames();
        assert_eq!(frames[0]["event"], "new_task");
        assert_eq!(frames[0]["data"], raw);
        assert_eq!(peers[1].events(), vec!["new_task"]);
        assert!(peers[2].frames().is_empty());
    }

    #[tokio::test]
    async fn task_updated_without_group_reaches_everyone() {
        let membership = Arc::new(StaticMembership::new(vec![(4, vec![1])]));
        let (router, mut peers) = setup(3, membership);
        let raw = json!({"task_id": 10, "is_completed": true});
        let report = router
            .dispatch(&peers[1].conn, decode("task_updated", raw.clone()))
            .await;
        assert_eq!(report.delivered, 3);
        for peer in &mut peers {
            let frames = peer.frames();
            assert_eq!(frames[0]["event"], "task_update");
            assert_eq!(frames[0]["data"], raw);
        }
    }

    #[tokio::test]
    async fn task_updated_with_group_is_scoped() {
        let membership = Arc::new(StaticMembership::new(vec![(4, vec![1])]));
        let (router, mut peers) = setup(2, membership);
        let raw = json!({"task_id": 10, "is_completed": false, "group_id": 4});
        let report = router
            .dispatch(&peers[1].conn, decode("task_updated", raw))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(peers[0].events(), vec!["task_update"]);
        assert!(peers[1].frames().is_empty());
    }

    #[tokio::test]
    async fn user_connected_registers_and_announces() {
        let (router, mut peers) = setup(1, Arc::new(UnscopedMembership));
        let (conn, rx) = make_connection("fresh");
        router.registry().attach(conn.clone());
        let mut fresh = Peer { conn, rx };

        let report = router
            .dispatch(
                &fresh.conn,
                decode("user_connected", json!({"id": 5, "username": "eva", "avatar": "x.png"})),
            )
            .await;
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(
            router.registry().identity(&"fresh".into()),
            Some(UserIdentity {
                id: UserId(5),
                username: "eva".into()
            })
        );
        for peer in [&mut peers[0], &mut fresh] {
            let frames = peer.frames();
            assert_eq!(frames[0]["event"], "user_status_change");
            assert_eq!(frames[0]["data"]["status"], "online");
            assert_eq!(frames[0]["data"]["userId"], 5);
        }
    }

    #[tokio::test]
    async fn full_outbound_buffer_only_affects_that_peer() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(registry.clone(), true));
        let (tx, _slow_rx) = mpsc::channel(1);
        let slow = Arc::new(ClientConnection::new("slow".into(), tx));
        let (fast, mut fast_rx) = make_connection("fast");
        registry.attach(slow.clone());
        registry.attach(fast.clone());
        let router = EventRouter::new(presence, Arc::new(UnscopedMembership));

        for i in 0..3 {
            let raw = json!({"task_id": i, "is_completed": true});
            let _ = router.dispatch(&fast, decode("task_updated", raw)).await;
        }
        assert_eq!(slow.drop_count(), 2);
        assert_eq!(fast.drop_count(), 0);
        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }
}
