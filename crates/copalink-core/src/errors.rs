//! Wire-level error hierarchy.
//!
//! Every [`RelayError`] is recoverable at the session level: the frame that
//! caused it is rejected, an `error` event is pushed back to the sender, and
//! the session keeps running. Transport failures never surface here; they
//! close the session instead.

use thiserror::Error;

/// Frame was not valid JSON or not an `{ "event", "data" }` envelope.
pub const INVALID_JSON: &str = "INVALID_JSON";
/// Envelope named an event the relay does not handle.
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
/// Payload was missing a required field or had a field of the wrong type.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";

/// Errors raised while decoding or validating an inbound frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame is not a JSON envelope.
    #[error("invalid JSON frame: {message}")]
    InvalidJson {
        /// Parser message.
        message: String,
    },

    /// Event name is not part of the protocol.
    #[error("unknown event '{event}'")]
    UnknownEvent {
        /// The event name as sent by the client.
        event: String,
    },

    /// Payload failed validation.
    #[error("invalid '{event}' payload: {message}")]
    InvalidPayload {
        /// The event whose payload was rejected.
        event: String,
        /// What was wrong with it.
        message: String,
    },
}

impl RelayError {
    /// Build an [`RelayError::InvalidPayload`].
    pub fn invalid_payload(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code sent to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => INVALID_JSON,
            Self::UnknownEvent { .. } => UNKNOWN_EVENT,
            Self::InvalidPayload { .. } => INVALID_PAYLOAD,
        }
    }

    /// Event name the error relates to, when known.
    #[must_use]
    pub fn event(&self) -> Option<&str> {
        match self {
            Self::InvalidJson { .. } => None,
            Self::UnknownEvent { event } | Self::InvalidPayload { event, .. } => Some(event),
        }
    }
}

/// Result alias for frame decoding.
pub type Result<T> = std::result::Result<T, RelayError>;
