//! Reconnect budget and backoff

use tokio::time::Duration;

use crate::config::SessionConfig;

/// Why a connection attempt ended unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another session holds the credential
    Conflict,
    /// The watchdog cancelled a stuck attempt
    Watchdog,
    /// Any other connect, transport or hardware failure
    Other,
}

/// Retry policy for reconnecting a session
///
/// Conflicts back off exponentially; every other failure waits a fixed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Reconnects allowed after consecutive failures before giving up
    pub max_retries: u32,
    /// First conflict delay (doubles each conflict)
    pub conflict_base: Duration,
    /// Delay after non-conflict failures
    pub retry_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            conflict_base: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from session configuration
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            conflict_base: config.conflict_backoff_base,
            retry_delay: config.retry_delay,
            ..Self::default()
        }
    }

    /// Delay before the reconnect following the `nth` consecutive conflict (1-based)
    ///
    /// `min(conflict_base * 2^(nth - 1), max_delay)`
    #[must_use]
    pub fn conflict_delay(&self, nth: u32) -> Duration {
        let exp = nth.saturating_sub(1);
        self.conflict_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay)
    }
}

/// Consecutive failure counters for one session
///
/// Every failure counts toward the general budget; only conflicts count toward
/// the conflict backoff. A healthy attempt resets both.
#[derive(Debug, Default, Clone)]
pub struct RetryBudget {
    failures: u32,
    conflicts: u32,
}

impl RetryBudget {
    /// Record a failed attempt
    ///
    /// Returns the delay before reconnecting, or `None` once the budget is exhausted.
    pub fn record(&mut self, policy: &RetryPolicy, kind: FailureKind) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if kind == FailureKind::Conflict {
            self.conflicts = self.conflicts.saturating_add(1);
        }

        if self.failures > policy.max_retries {
            return None;
        }

        Some(match kind {
            FailureKind::Conflict => policy.conflict_delay(self.conflicts),
            FailureKind::Watchdog | FailureKind::Other => policy.retry_delay,
        })
    }

    /// Forget past failures
    pub fn reset(&mut self) {
        self.failures = 0;
        self.conflicts = 0;
    }

    /// Consecutive failures so far
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Consecutive conflicts so far
    #[must_use]
    pub const fn conflicts(&self) -> u32 {
        self.conflicts
    }
}
