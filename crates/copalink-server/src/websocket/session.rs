//! WebSocket session lifecycle. Handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use copalink_core::{ConnectionId, ServerEvent};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::router::EventRouter;

/// How long the writer gets to flush queued frames after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a Close frame.
    ClientClose,
    /// The stream ended or errored.
    TransportError,
    /// No activity within the heartbeat timeout.
    HeartbeatTimeout,
    /// Closed by the server (superseded connection).
    ServerClose,
    /// Server shutdown.
    Shutdown,
}

impl CloseReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClose => "client_close",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ServerClose => "server_close",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Attaches the connection and queues `connection_established`
/// 2. Dispatches inbound text (and UTF-8 binary) frames through the router
/// 3. Forwards queued frames and periodic Pings from a writer task
/// 4. Ends on close, transport error, heartbeat timeout, server close or shutdown
/// 5. Detaches the connection, announcing "offline" if it was registered
#[instrument(skip_all, fields(conn_id = %connection_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    router: Arc<EventRouter>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> CloseReason {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.outbound_buffer);
    let connection = Arc::new(ClientConnection::new(connection_id.clone(), send_tx));

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    router.registry().attach(connection.clone());
    let _ = connection.open();
    let _ = connection.send_event(&ServerEvent::ConnectionEstablished {
        connection_id: connection_id.clone(),
    });

    // Writer: queued frames plus periodic Pings. On `stop` it flushes what is
    // already queued and sends a Close frame.
    let stop = CancellationToken::new();
    let writer_stop = stop.clone();
    let ping_every = config.heartbeat_interval();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        return;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
                () = writer_stop.cancelled() => break,
            }
        }

        while let Ok(text) = send_rx.try_recv() {
            if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let mut heartbeat = tokio::spawn(run_heartbeat(
        connection.clone(),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        shutdown.child_token(),
    ));

    let reason = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read failed");
                        break CloseReason::TransportError;
                    }
                    None => break CloseReason::TransportError,
                };
                connection.mark_alive();

                let text = match msg {
                    Message::Text(ref t) => Some(t.to_string()),
                    Message::Binary(ref data) => {
                        if let Ok(s) = std::str::from_utf8(data) {
                            Some(s.to_owned())
                        } else {
                            info!(len = data.len(), "received non-UTF8 binary frame");
                            None
                        }
                    }
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break CloseReason::ClientClose;
                    }
                    Message::Ping(_) | Message::Pong(_) => None,
                };

                if let Some(text) = text {
                    let _ = handle_message(&text, &connection, &router).await;
                }
            }
            () = connection.closed() => break CloseReason::ServerClose,
            () = shutdown.cancelled() => break CloseReason::Shutdown,
            result = &mut heartbeat => {
                match result {
                    Ok(HeartbeatResult::TimedOut) => {
                        warn!(
                            idle = ?connection.last_seen_elapsed(),
                            timeout = ?config.heartbeat_timeout(),
                            "client unresponsive, disconnecting"
                        );
                        break CloseReason::HeartbeatTimeout;
                    }
                    Ok(HeartbeatResult::Cancelled) | Err(_) => break CloseReason::Shutdown,
                }
            }
        }
    };

    // Clean up
    let _ = connection.mark_closed();
    heartbeat.abort();
    let identity = router.presence().depart(&connection_id);

    stop.cancel();
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        reason = reason.as_str(),
        user_id = identity.as_ref().map(|i| i.id.get()),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    reason
}
