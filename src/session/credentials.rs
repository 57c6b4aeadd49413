//! Credential rotation with per-credential cooldown

use std::collections::HashMap;

use secrecy::SecretString;
use tokio::time::{Duration, Instant};

/// Round-robin pool of API credentials
///
/// A credential blamed for a conflict is put on cooldown and skipped until the
/// cooldown window has elapsed.
pub struct CredentialPool {
    credentials: Vec<SecretString>,
    index: usize,
    cooldowns: HashMap<usize, Instant>,
    cooldown: Duration,
}

impl CredentialPool {
    /// Create a pool starting at the first credential
    #[must_use]
    pub fn new(credentials: Vec<SecretString>, cooldown: Duration) -> Self {
        Self {
            credentials,
            index: 0,
            cooldowns: HashMap::new(),
            cooldown,
        }
    }

    /// Index of the current credential
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of credentials in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Whether the pool has no credentials
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Whether credential `idx` is cooling down at `now`
    #[must_use]
    pub fn is_cooling_down(&self, idx: usize, now: Instant) -> bool {
        self.cooldowns
            .get(&idx)
            .is_some_and(|failed_at| now.saturating_duration_since(*failed_at) < self.cooldown)
    }

    /// Select the next usable credential, starting from the current index
    ///
    /// Returns `None` when every credential is cooling down.
    pub fn select(&mut self, now: Instant) -> Option<(usize, SecretString)> {
        let len = self.credentials.len();
        for offset in 0..len {
            let idx = (self.index + offset) % len;
            if !self.is_cooling_down(idx, now) {
                self.index = idx;
                return Some((idx, self.credentials[idx].clone()));
            }
        }
        None
    }

    /// Put the current credential on cooldown and advance to the next one
    pub fn mark_conflict(&mut self, now: Instant) {
        if self.credentials.is_empty() {
            return;
        }

        self.cooldowns.insert(self.index, now);
        let previous = self.index;
        self.index = (self.index + 1) % self.credentials.len();
        tracing::warn!(
            credential = previous,
            next = self.index,
            cooldown_secs = self.cooldown.as_secs(),
            "credential on cooldown after conflict"
        );
    }

    /// Forget every cooldown
    pub fn clear_cooldowns(&mut self) {
        self.cooldowns.clear();
    }
}
