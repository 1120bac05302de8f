//! Frame dispatch: decodes one text frame and hands it to the router.

use std::sync::Arc;

use copalink_core::{ClientEventKind, InboundEvent, RelayError, ServerEvent};
use metrics::counter;
use tracing::{instrument, warn};

use super::connection::ClientConnection;
use crate::metrics::RELAY_REJECTED_TOTAL;
use crate::router::{DeliveryReport, EventRouter};

/// Result of handling one inbound frame.
#[derive(Debug)]
pub struct HandleResult {
    /// Event kind, when the frame decoded.
    pub event: Option<ClientEventKind>,
    /// Delivery outcome (default when rejected).
    pub report: DeliveryReport,
    /// Why the frame was rejected, if it was.
    pub error: Option<RelayError>,
}

/// Handle one text frame from `origin`.
///
/// Malformed frames are answered with an `error` event on the same
/// connection; the session stays open.
#[instrument(skip_all, fields(conn_id = %origin.id, event))]
pub async fn handle_message(
    text: &str,
    origin: &Arc<ClientConnection>,
    router: &EventRouter,
) -> HandleResult {
    match InboundEvent::from_frame(text) {
        Ok(event) => {
            let kind = event.kind();
            let _ = tracing::Span::current().record("event", kind.as_str());
            let report = router.dispatch(origin, event).await;
            HandleResult {
                event: Some(kind),
                report,
                error: None,
            }
        }
        Err(err) => {
            warn!(code = err.code(), error = %err, "rejected frame");
            counter!(RELAY_REJECTED_TOTAL, "code" => err.code()).increment(1);
            let _ = origin.send_event(&ServerEvent::from(&err));
            HandleResult {
                event: None,
                report: DeliveryReport::default(),
                error: Some(err),
            }
        }
    }
}
