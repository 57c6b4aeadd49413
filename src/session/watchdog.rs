//! Stuck-attempt watchdog
//!
//! While the engine waits on the remote service (`Processing`), nothing else
//! guarantees forward progress. The watchdog ends an attempt that has sat in
//! `Processing` with no event for longer than the threshold. Time spent running
//! tools locally does not count. Whether to reconnect is left to the orchestrator.

use std::sync::Arc;

use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::state::{SessionState, SessionStatus};

/// Stall detector for one connection attempt
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    threshold: Duration,
    interval: Duration,
}

impl Watchdog {
    /// Create a watchdog checking every `interval`
    #[must_use]
    pub fn new(threshold: Duration, interval: Duration) -> Self {
        Self {
            threshold,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Whether the attempt is stalled at `now`
    #[must_use]
    pub fn is_stalled(&self, status: SessionStatus, last_progress: Instant, now: Instant) -> bool {
        status == SessionStatus::Processing
            && now.saturating_duration_since(last_progress) >= self.threshold
    }

    /// Watch until the attempt stalls or `cancel` fires
    ///
    /// Returns `true` if the attempt stalled. Fires at most once.
    pub async fn run(self, state: Arc<SessionState>, cancel: CancellationToken) -> bool {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            if state.tools_running() {
                continue;
            }

            let last = state.last_progress();
            let now = Instant::now();
            if self.is_stalled(state.status(), last, now) {
                tracing::warn!(
                    stalled_ms = u64::try_from(now.duration_since(last).as_millis()).unwrap_or(u64::MAX),
                    threshold_ms = u64::try_from(self.threshold.as_millis()).unwrap_or(u64::MAX),
                    "no progress while processing, forcing reconnect"
                );
                return true;
            }
        }
    }
}
