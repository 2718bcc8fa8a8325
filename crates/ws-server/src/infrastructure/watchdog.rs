//! WatchdogMonitor: periodic liveness supervision.
//!
//! Every `period` the watchdog walks the open connections.  A connection that
//! has been silent for more than two periods is evicted; every other one is
//! sent a ping, so a healthy peer answers with a pong before its next check.
//!
//! The watchdog never tears a connection down itself.  It records
//! [`CloseCause::WatchdogTimeout`] on the connection, and the connection's own
//! session task performs the teardown and fires the error callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ws_core::Frame;

use super::connection::SendError;
use super::registry::ConnectionRegistry;
use crate::error::CloseCause;

/// What the watchdog does with one connection on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still within its grace window: send a ping.
    Ping,
    /// Silent for more than two periods: evict.
    Evict,
}

/// Decides a connection's fate from its idle time.
pub fn verdict(idle: Duration, period: Duration) -> Verdict {
    if idle > period.saturating_mul(2) {
        Verdict::Evict
    } else {
        Verdict::Ping
    }
}

/// Tick counts from one [`sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

/// Applies one watchdog tick to every open connection in `registry`.
pub fn sweep(registry: &ConnectionRegistry, period: Duration, now: Instant) -> SweepReport {
    let mut report = SweepReport::default();
    for conn in registry.snapshot() {
        if !conn.is_open() {
            continue;
        }
        match verdict(conn.idle_for(now), period) {
            Verdict::Evict => {
                warn!(conn = %conn.id(), peer = %conn.peer(), "watchdog timeout; evicting");
                conn.request_close(CloseCause::WatchdogTimeout);
                report.evicted += 1;
            }
            Verdict::Ping => match conn.send_frame(&Frame::ping(Vec::new())) {
                Ok(()) => report.pinged += 1,
                Err(SendError::Full) => {
                    warn!(conn = %conn.id(), "outbound queue full on watchdog ping");
                    conn.request_close(CloseCause::SlowConsumer);
                }
                // Writer already gone: the session is tearing down.
                Err(SendError::Closed) => {}
            },
        }
    }
    report
}

/// Runs the watchdog until `shutdown` is cancelled.
pub async fn run_watchdog(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) {
    info!(period_ms = period.as_millis() as u64, "watchdog started");

    // First check one full period after start, not immediately.
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep(&registry, period, Instant::now());
                debug!(pinged = report.pinged, evicted = report.evicted, "watchdog tick");
            }
        }
    }

    info!("watchdog stopped");
}
