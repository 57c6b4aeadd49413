//! Shared session state
//!
//! One `SessionState` exists per orchestrator run. It is shared by `Arc` with the
//! attempt tasks and the session handle; every field is atomic or individually
//! locked so the watchdog and send loop always observe the latest write.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Engine status as seen by the user interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Stopped,
    Initializing,
    Connecting,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl SessionStatus {
    /// Whether outbound microphone audio is suppressed in this status
    #[must_use]
    pub const fn blocks_send(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Initializing => "INITIALIZING",
            Self::Connecting => "CONNECTING",
            Self::Listening => "LISTENING",
            Self::Processing => "PROCESSING",
            Self::Speaking => "SPEAKING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// State shared between the orchestrator, its attempt tasks and session handles
#[derive(Debug)]
pub struct SessionState {
    active: AtomicBool,
    status: watch::Sender<SessionStatus>,
    last_progress: Mutex<Instant>,
    tools_running: AtomicBool,
    send_cooldown_until: Mutex<Option<Instant>>,
    resumption_token: Mutex<Option<String>>,
    voice: Mutex<String>,
    pending_voice_change: AtomicBool,
    voice_changed: Notify,
    shutdown: CancellationToken,
}

impl SessionState {
    /// Create a stopped state with an initial voice
    #[must_use]
    pub fn new(voice: impl Into<String>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Stopped);
        Self {
            active: AtomicBool::new(false),
            status,
            last_progress: Mutex::new(Instant::now()),
            tools_running: AtomicBool::new(false),
            send_cooldown_until: Mutex::new(None),
            resumption_token: Mutex::new(None),
            voice: Mutex::new(voice.into()),
            pending_voice_change: AtomicBool::new(false),
            voice_changed: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    // -- lifecycle ------------------------------------------------------------

    /// Whether the engine should keep running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the engine as running
    ///
    /// Has no effect once the session has been shut down.
    pub fn activate(&self) {
        if !self.shutdown.is_cancelled() {
            self.active.store(true, Ordering::SeqCst);
        }
    }

    /// Ask the engine to stop; cancels the current attempt
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!("session deactivated");
        }
        self.shutdown.cancel();
    }

    /// Token cancelled when the session shuts down
    ///
    /// Attempt tokens are children of this token.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    // -- status ---------------------------------------------------------------

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Transition to a new status
    ///
    /// Transitions are refused while inactive, except the final `Stopped`.
    /// Returns whether the status changed.
    pub fn set_status(&self, status: SessionStatus) -> bool {
        if !self.is_active() && status != SessionStatus::Stopped {
            tracing::trace!(%status, "ignoring status change while inactive");
            return false;
        }

        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            self.touch();
            tracing::debug!(%status, "status changed");
        }
        changed
    }

    /// Record progress for the watchdog
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_progress.lock() {
            *last = Instant::now();
        }
    }

    /// Instant of the most recent progress
    #[must_use]
    pub fn last_progress(&self) -> Instant {
        self.last_progress
            .lock()
            .map_or_else(|_| Instant::now(), |last| *last)
    }

    /// Mark a tool batch as running until the guard is dropped
    ///
    /// Stall detection is paused while a batch runs; dropping the guard counts
    /// as progress.
    #[must_use]
    pub fn tool_batch(&self) -> ToolBatch<'_> {
        self.tools_running.store(true, Ordering::SeqCst);
        ToolBatch { state: self }
    }

    /// Whether a tool batch is executing
    #[must_use]
    pub fn tools_running(&self) -> bool {
        self.tools_running.load(Ordering::SeqCst)
    }

    // -- echo suppression -----------------------------------------------------

    /// Suppress outbound audio for `cooldown` from `now`
    pub fn start_send_cooldown(&self, now: Instant, cooldown: Duration) {
        if let Ok(mut until) = self.send_cooldown_until.lock() {
            *until = Some(now + cooldown);
        }
    }

    /// End of the current send cooldown, if any
    #[must_use]
    pub fn send_cooldown_until(&self) -> Option<Instant> {
        self.send_cooldown_until.lock().ok().and_then(|until| *until)
    }

    /// Whether microphone audio may be sent at `now`
    #[must_use]
    pub fn may_send(&self, now: Instant) -> bool {
        if self.status().blocks_send() {
            return false;
        }
        self.send_cooldown_until().is_none_or(|until| now >= until)
    }

    // -- resumption -----------------------------------------------------------

    /// Resumption token from the most recent connection, if trusted
    #[must_use]
    pub fn resumption_token(&self) -> Option<String> {
        self.resumption_token.lock().ok().and_then(|t| t.clone())
    }

    /// Store the token from a resumption update
    pub fn set_resumption_token(&self, token: String) {
        if let Ok(mut current) = self.resumption_token.lock() {
            *current = Some(token);
        }
    }

    /// Forget the resumption token
    pub fn clear_resumption_token(&self) {
        if let Ok(mut current) = self.resumption_token.lock() {
            if current.take().is_some() {
                tracing::debug!("resumption token cleared");
            }
        }
    }

    // -- voice ----------------------------------------------------------------

    /// Voice used for the next connection
    #[must_use]
    pub fn voice(&self) -> String {
        self.voice.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Request a reconnect with a different voice
    pub fn request_voice_change(&self, voice: &str) {
        if let Ok(mut current) = self.voice.lock() {
            *current = voice.to_string();
        }
        self.pending_voice_change.store(true, Ordering::SeqCst);
        self.voice_changed.notify_one();
        tracing::info!(voice, "voice change requested");
    }

    /// Whether a voice change is waiting for a reconnect
    #[must_use]
    pub fn voice_change_pending(&self) -> bool {
        self.pending_voice_change.load(Ordering::SeqCst)
    }

    /// Consume a pending voice change
    pub fn take_voice_change(&self) -> bool {
        self.pending_voice_change.swap(false, Ordering::SeqCst)
    }

    /// Resolves when a voice change is requested
    pub async fn voice_change_requested(&self) {
        self.voice_changed.notified().await;
    }
}

/// Guard returned by [`SessionState::tool_batch`]
#[derive(Debug)]
pub struct ToolBatch<'a> {
    state: &'a SessionState,
}

impl Drop for ToolBatch<'_> {
    fn drop(&mut self) {
        self.state.tools_running.store(false, Ordering::SeqCst);
        self.state.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_state() -> SessionState {
        let state = SessionState::new("Puck");
        state.activate();
        state
    }

    #[test]
    fn status_changes_only_while_active() {
        let state = SessionState::new("Puck");
        assert!(!state.set_status(SessionStatus::Listening));
        assert_eq!(state.status(), SessionStatus::Stopped);

        state.activate();
        assert!(state.set_status(SessionStatus::Listening));
        assert_eq!(state.status(), SessionStatus::Listening);

        state.deactivate();
        assert!(!state.set_status(SessionStatus::Speaking));
        assert!(state.set_status(SessionStatus::Stopped));
        assert_eq!(state.status(), SessionStatus::Stopped);
    }

    #[test]
    fn same_status_is_not_a_change() {
        let state = active_state();
        assert!(state.set_status(SessionStatus::Processing));
        assert!(!state.set_status(SessionStatus::Processing));
    }

    #[test]
    fn subscribers_see_latest_status() {
        let state = active_state();
        let rx = state.subscribe();
        state.set_status(SessionStatus::Connecting);
        state.set_status(SessionStatus::Speaking);
        assert_eq!(*rx.borrow(), SessionStatus::Speaking);
    }

    #[test]
    fn send_blocked_while_busy() {
        let state = active_state();
        let now = Instant::now();

        state.set_status(SessionStatus::Listening);
        assert!(state.may_send(now));

        state.set_status(SessionStatus::Processing);
        assert!(!state.may_send(now));

        state.set_status(SessionStatus::Speaking);
        assert!(!state.may_send(now));
    }

    #[test]
    fn send_blocked_during_cooldown() {
        let state = active_state();
        state.set_status(SessionStatus::Listening);

        let now = Instant::now();
        state.start_send_cooldown(now, Duration::from_millis(800));
        assert!(!state.may_send(now));
        assert!(!state.may_send(now + Duration::from_millis(799)));
        assert!(state.may_send(now + Duration::from_millis(800)));
    }

    #[test]
    fn deactivate_cancels_shutdown_token() {
        let state = active_state();
        let child = state.shutdown_token().child_token();
        state.deactivate();
        assert!(!state.is_active());
        assert!(child.is_cancelled());

        // A shut down session cannot be revived
        state.activate();
        assert!(!state.is_active());
    }

    #[test]
    fn resumption_token_lifecycle() {
        let state = active_state();
        assert_eq!(state.resumption_token(), None);
        state.set_resumption_token("handle-1".to_string());
        state.set_resumption_token("handle-2".to_string());
        assert_eq!(state.resumption_token().as_deref(), Some("handle-2"));
        state.clear_resumption_token();
        assert_eq!(state.resumption_token(), None);
    }

    #[test]
    fn voice_change_is_consumed_once() {
        let state = active_state();
        state.request_voice_change("Kore");
        assert_eq!(state.voice(), "Kore");
        assert!(state.voice_change_pending());
        assert!(state.take_voice_change());
        assert!(!state.take_voice_change());
    }

    #[test]
    fn tool_batch_flag_cleared_on_drop() {
        let state = active_state();
        assert!(!state.tools_running());
        {
            let _batch = state.tool_batch();
            assert!(state.tools_running());
        }
        assert!(!state.tools_running());
    }

    #[tokio::test]
    async fn voice_change_notifies_waiter() {
        let state = std::sync::Arc::new(active_state());
        let waiter = {
            let state = std::sync::Arc::clone(&state);
            tokio::spawn(async move { state.voice_change_requested().await })
        };
        tokio::task::yield_now().await;
        state.request_voice_change("Charon");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
