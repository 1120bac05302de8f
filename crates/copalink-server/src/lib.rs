//! # copalink-server
//!
//! Real-time presence and event relay for CopaLink chat clients.
//!
//! - [`registry`]: the single owned map between users and live connections
//! - [`presence`]: online/offline fan-out derived from registry mutations
//! - [`membership`]: injected group → members resolution
//! - [`router`]: per-event delivery targeting
//! - [`websocket`]: connection state, heartbeat, frame dispatch, session loop
//! - [`server`]: Axum routes (`/`, `/health`, `/metrics`, `/ws`) and listener
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod membership;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod websocket;
