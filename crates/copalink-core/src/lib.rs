//! # copalink-core
//!
//! Foundation types for the CopaLink relay.
//!
//! - **Branded IDs**: `ConnectionId` (UUID v7 newtype) and integer ids
//!   (`UserId`, `GroupId`, `TaskId`, `MessageId`) mirroring store keys
//! - **Wire events**: the `{ "event", "data" }` envelope, inbound payloads
//!   and the outbound `ServerEvent` enum
//! - **Errors**: `RelayError` with stable wire codes
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;

pub use errors::{RelayError, Result};
pub use events::{
    ClientEventKind, Envelope, InboundEvent, MessageEvent, PresenceStatus, ServerEvent,
    TaskCreatedEvent, TaskUpdatedEvent, Target, TypingEvent, UserIdentity,
};
pub use ids::{ConnectionId, GroupId, MessageId, TaskId, UserId};
pub use logging::{LogFormat, init_subscriber};
