//! WebSocket connection state, heartbeat, frame dispatch, and session lifecycle.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;
