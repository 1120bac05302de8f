//! Heartbeat liveness monitoring.
//!
//! Pings themselves are written by the session's outbound task; this loop
//! only watches the alive flag that any inbound frame or Pong sets.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No client activity for the whole timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Consecutive silent ticks tolerated before timing out.
///
/// `ceil(timeout / interval)`, at least 1.
pub fn max_missed_ticks(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let ticks = timeout.as_millis().div_ceil(interval_ms).max(1);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Watch a connection until it goes silent or `cancel` fires.
///
/// At each `interval` tick the alive flag is checked and reset. Once
/// [`max_missed_ticks`] consecutive ticks pass without activity the
/// connection is considered dead.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval_at(time::Instant::now() + interval, interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = max_missed_ticks(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    debug!(conn_id = %connection.id, missed, max_missed, "no activity since last tick");
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(32);
        Arc::new(ClientConnection::new("hb_conn".into(), tx))
    }

    #[test]
    fn max_missed_rounds_up() {
        assert_eq!(max_missed_ticks(Duration::from_secs(25), Duration::from_secs(60)), 3);
        assert_eq!(max_missed_ticks(Duration::from_secs(30), Duration::from_secs(90)), 3);
        assert_eq!(max_missed_ticks(Duration::from_secs(10), Duration::from_secs(5)), 1);
        assert_eq!(max_missed_ticks(Duration::ZERO, Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let conn = make_connection();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(conn, Duration::from_secs(100), Duration::from_secs(300), cancel2).await
        });

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_times_out() {
        let conn = make_connection();
        let _ = conn.check_alive();
        let started = time::Instant::now();

        let result = run_heartbeat(
            conn,
            Duration::from_millis(100),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(result, HeartbeatResult::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn active_connection_stays_alive() {
        let conn = make_connection();
        let conn2 = conn.clone();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(conn2, Duration::from_millis(100), Duration::from_millis(200), cancel2)
                .await
        });

        for _ in 0..10 {
            time::sleep(Duration::from_millis(50)).await;
            conn.mark_alive();
        }

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_then_silence_times_out() {
        let conn = make_connection();
        let conn2 = conn.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(
                conn2,
                Duration::from_millis(100),
                Duration::from_millis(200),
                CancellationToken::new(),
            )
            .await
        });

        for _ in 0..3 {
            time::sleep(Duration::from_millis(50)).await;
            conn.mark_alive();
        }

        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
    }
}
