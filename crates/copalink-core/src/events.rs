//! Wire protocol: named JSON events in both directions.
//!
//! Every frame is an envelope `{ "event": "<name>", "data": { ... } }`.
//! Inbound envelopes are decoded into [`InboundEvent`]; relayed payloads keep
//! the raw JSON object so recipients see exactly what the sender sent.
//! Outbound frames are built from [`ServerEvent`].

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{RelayError, Result};
use crate::ids::{ConnectionId, GroupId, MessageId, TaskId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A named event frame as it appears on the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload. Missing payloads decode as `null`.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse a text frame into an envelope.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidJson {
            message: e.to_string(),
        })
    }
}

/// Client → server event names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    /// Identity announcement.
    UserConnected,
    /// Chat message (private or group).
    SendMessage,
    /// Typing indicator.
    Typing,
    /// A task was created in a group.
    TaskCreated,
    /// A task's completion state changed.
    TaskUpdated,
}

impl ClientEventKind {
    /// All inbound kinds.
    pub const ALL: [Self; 5] = [
        Self::UserConnected,
        Self::SendMessage,
        Self::Typing,
        Self::TaskCreated,
        Self::TaskUpdated,
    ];

    /// Look up a kind by its wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserConnected => "user_connected",
            Self::SendMessage => "send_message",
            Self::Typing => "typing",
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Self-reported identity from `user_connected`. Not verified by the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// User id in the external store.
    pub id: UserId,
    /// Display name.
    pub username: String,
}

/// Delivery topic of a message or typing indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// Point-to-point delivery to one user.
    User(UserId),
    /// Delivery to the members of a group.
    Group(GroupId),
}

impl Target {
    fn resolve(event: &str, recipient: Option<UserId>, group: Option<GroupId>) -> Result<Self> {
        match (recipient, group) {
            (Some(user), None) => Ok(Self::User(user)),
            (None, Some(group)) => Ok(Self::Group(group)),
            (Some(_), Some(_)) => Err(RelayError::invalid_payload(
                event,
                "recipient_id and group_id are mutually exclusive",
            )),
            (None, None) => Err(RelayError::invalid_payload(
                event,
                "one of recipient_id or group_id is required",
            )),
        }
    }
}

/// `send_message` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Author of the message.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Private recipient.
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    /// Group topic.
    #[serde(default)]
    pub group_id: Option<GroupId>,
    /// Id assigned by the persistence layer before relaying.
    pub message_id: MessageId,
    /// Display name of the sender.
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Client-side creation timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `typing` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// Who is typing.
    #[serde(rename = "userId")]
    pub user_id: UserId,
    /// Their display name.
    pub username: String,
    /// Private conversation partner.
    #[serde(default)]
    pub recipient_id: Option<UserId>,
    /// Group conversation.
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// `task_created` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCreatedEvent {
    /// Owning group.
    pub group_id: GroupId,
    /// New task id.
    pub task_id: TaskId,
    /// Task title.
    pub title: String,
    /// Display name of the creator.
    pub creator_name: String,
}

/// `task_updated` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdatedEvent {
    /// Task that changed.
    pub task_id: TaskId,
    /// New completion state.
    pub is_completed: bool,
    /// Owning group, when the client includes it.
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// A decoded and validated client event.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// `user_connected`.
    UserConnected(UserIdentity),
    /// `send_message`; `raw` is relayed verbatim.
    SendMessage {
        /// Typed view of the payload.
        message: MessageEvent,
        /// Resolved topic.
        target: Target,
        /// Payload as received.
        raw: Value,
    },
    /// `typing`.
    Typing {
        /// Typed view of the payload.
        typing: TypingEvent,
        /// Resolved topic.
        target: Target,
    },
    /// `task_created`; `raw` is relayed verbatim.
    TaskCreated {
        /// Typed view of the payload.
        task: TaskCreatedEvent,
        /// Payload as received.
        raw: Value,
    },
    /// `task_updated`; `raw` is relayed verbatim.
    TaskUpdated {
        /// Typed view of the payload.
        task: TaskUpdatedEvent,
        /// Payload as received.
        raw: Value,
    },
}

fn payload<T: DeserializeOwned>(kind: ClientEventKind, data: &Value) -> Result<T> {
    if !data.is_object() {
        return Err(RelayError::invalid_payload(
            kind.as_str(),
            "payload must be a JSON object",
        ));
    }
    T::deserialize(data).map_err(|e| RelayError::invalid_payload(kind.as_str(), e.to_string()))
}

impl InboundEvent {
    /// Decode and validate an envelope.
    pub fn decode(envelope: Envelope) -> Result<Self> {
        let Some(kind) = ClientEventKind::from_name(&envelope.event) else {
            return Err(RelayError::UnknownEvent {
                event: envelope.event,
            });
        };
        let data = envelope.data;

        match kind {
            ClientEventKind::UserConnected => Ok(Self::UserConnected(payload(kind, &data)?)),
            ClientEventKind::SendMessage => {
                let message: MessageEvent = payload(kind, &data)?;
                let target = Target::resolve(kind.as_str(), message.recipient_id, message.group_id)?;
                Ok(Self::SendMessage {
                    message,
                    target,
                    raw: data,
                })
            }
            ClientEventKind::Typing => {
                let typing: TypingEvent = payload(kind, &data)?;
                let target = Target::resolve(kind.as_str(), typing.recipient_id, typing.group_id)?;
                Ok(Self::Typing { typing, target })
            }
            ClientEventKind::TaskCreated => Ok(Self::TaskCreated {
                task: payload(kind, &data)?,
                raw: data,
            }),
            ClientEventKind::TaskUpdated => Ok(Self::TaskUpdated {
                task: payload(kind, &data)?,
                raw: data,
            }),
        }
    }

    /// Decode a raw text frame.
    pub fn from_frame(text: &str) -> Result<Self> {
        Self::decode(Envelope::parse(text)?)
    }

    /// Kind of this event.
    #[must_use]
    pub fn kind(&self) -> ClientEventKind {
        match self {
            Self::UserConnected(_) => ClientEventKind::UserConnected,
            Self::SendMessage { .. } => ClientEventKind::SendMessage,
            Self::Typing { .. } => ClientEventKind::Typing,
            Self::TaskCreated { .. } => ClientEventKind::TaskCreated,
            Self::TaskUpdated { .. } => ClientEventKind::TaskUpdated,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound events
// ─────────────────────────────────────────────────────────────────────────────

/// Presence state carried by `user_status_change`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// User registered a connection.
    Online,
    /// User's connection closed.
    Offline,
}

impl PresenceStatus {
    /// Wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Server → client events.
///
/// Serialized adjacently tagged, which yields the `{ "event", "data" }`
/// envelope directly. Relayed payloads are carried as raw JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Greeting sent once the session is open.
    ConnectionEstablished {
        /// Id of the new connection.
        connection_id: ConnectionId,
    },
    /// Presence transition of a user.
    UserStatusChange {
        /// User whose presence changed.
        user_id: UserId,
        /// Their display name.
        username: String,
        /// New status.
        status: PresenceStatus,
    },
    /// Relayed `send_message` payload.
    NewMessage(Value),
    /// Acknowledgment that the relay accepted a message.
    MessageSent {
        /// Always `true` for accepted messages.
        success: bool,
        /// Echo of the payload's `message_id`.
        message_id: MessageId,
    },
    /// Someone is typing.
    UserTyping {
        /// Who is typing.
        user_id: UserId,
        /// Their display name.
        username: String,
        /// Group conversation, absent for private typing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        /// Always `true`.
        is_typing: bool,
    },
    /// Relayed `task_created` payload.
    NewTask(Value),
    /// Relayed `task_updated` payload.
    TaskUpdate(Value),
    /// This connection was replaced by a newer one for the same user.
    SessionSuperseded {
        /// Id of the replacing connection.
        connection_id: ConnectionId,
    },
    /// A frame from this connection was rejected.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable reason.
        message: String,
        /// Event the rejected frame named, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

impl ServerEvent {
    /// Presence event for an identity.
    #[must_use]
    pub fn presence(identity: &UserIdentity, status: PresenceStatus) -> Self {
        Self::UserStatusChange {
            user_id: identity.id,
            username: identity.username.clone(),
            status,
        }
    }

    /// `user_typing` for a typing payload, with `groupId` only for groups.
    #[must_use]
    pub fn typing(typing: &TypingEvent, target: Target) -> Self {
        Self::UserTyping {
            user_id: typing.user_id,
            username: typing.username.clone(),
            group_id: match target {
                Target::Group(group) => Some(group),
                Target::User(_) => None,
            },
            is_typing: true,
        }
    }

    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::UserStatusChange { .. } => "user_status_change",
            Self::NewMessage(_) => "new_message",
            Self::MessageSent { .. } => "message_sent",
            Self::UserTyping { .. } => "user_typing",
            Self::NewTask(_) => "new_task",
            Self::TaskUpdate(_) => "task_update",
            Self::SessionSuperseded { .. } => "session_superseded",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&RelayError> for ServerEvent {
    fn from(err: &RelayError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
            event: err.event().map(ToOwned::to_owned),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
