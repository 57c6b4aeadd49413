//! Session control loop
//!
//! Selects a credential, connects, runs one attempt and decides what happens
//! next: reconnect at once (voice change, go-away), back off and retry, or stop
//! once the retry budget is spent.

use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::attempt::{AttemptContext, AttemptOutcome, AttemptReport};
use super::credentials::CredentialPool;
use super::history::HistoryBuffer;
use super::retry::{FailureKind, RetryBudget, RetryPolicy};
use super::state::{SessionState, SessionStatus};
use super::watchdog::Watchdog;
use crate::audio::{AudioBackend, AudioIo};
use crate::config::{AudioConfig, Config, SUPPORTED_VOICES, SessionConfig};
use crate::tools::{SessionTools, ToolDispatcher};
use crate::transport::{ConnectConfig, Connector};
use crate::{Error, Result};

/// Drives a voice session until it is stopped or runs out of retries
pub struct SessionOrchestrator {
    config: SessionConfig,
    audio_config: AudioConfig,
    state: Arc<SessionState>,
    connector: Arc<dyn Connector>,
    backend: Arc<dyn AudioBackend>,
    dispatcher: Arc<dyn ToolDispatcher>,
    credentials: CredentialPool,
    history: Arc<Mutex<HistoryBuffer>>,
    policy: RetryPolicy,
}

impl SessionOrchestrator {
    /// Create an orchestrator
    ///
    /// `tools` is wrapped with the session control tools (exit, change voice).
    #[must_use]
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        backend: Arc<dyn AudioBackend>,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Self {
        let state = Arc::new(SessionState::new(config.session.voice.clone()));
        let dispatcher: Arc<dyn ToolDispatcher> =
            Arc::new(SessionTools::new(tools, Arc::clone(&state)));

        Self {
            config: config.session.clone(),
            audio_config: config.audio,
            credentials: CredentialPool::new(
                config.credentials.clone(),
                config.session.credential_cooldown,
            ),
            history: Arc::new(Mutex::new(HistoryBuffer::new(config.session.history_turns))),
            policy: RetryPolicy::from_config(&config.session),
            state,
            connector,
            backend,
            dispatcher,
        }
    }

    /// Handle for controlling the session from other tasks
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: Arc::clone(&self.state),
            history: Arc::clone(&self.history),
        }
    }

    /// Run the session until stopped
    ///
    /// Audio devices are opened once here and shared by every attempt.
    ///
    /// # Errors
    ///
    /// Returns error if no credentials are configured, the audio devices cannot be
    /// opened, or the retry budget is exhausted (the last attempt's error)
    pub async fn run(mut self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(Error::Config("no credentials configured".to_string()));
        }

        self.state.activate();
        self.state.set_status(SessionStatus::Initializing);
        tracing::info!(
            credentials = self.credentials.len(),
            voice = %self.state.voice(),
            "session starting"
        );

        let result = match AudioIo::open(Arc::clone(&self.backend), self.audio_config).await {
            Ok(audio) => {
                let audio = Arc::new(audio);
                let result = self.retry_loop(&audio).await;
                audio.close();
                result
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open audio devices");
                Err(e)
            }
        };

        if result.is_err() {
            self.state.set_status(SessionStatus::Error);
        }
        self.state.deactivate();
        self.state.set_status(SessionStatus::Stopped);
        tracing::info!("session stopped");

        result
    }

    async fn retry_loop(&mut self, audio: &Arc<AudioIo>) -> Result<()> {
        let mut budget = RetryBudget::default();
        let mut attempt = 0u32;

        while self.state.is_active() {
            let Some((index, credential)) = self.credentials.select(Instant::now()) else {
                let wait = self.config.all_cooldown_wait;
                tracing::warn!(wait_secs = wait.as_secs(), "all credentials cooling down");
                if !self.pause(wait).await {
                    break;
                }
                self.credentials.clear_cooldowns();
                continue;
            };

            attempt += 1;
            let span = tracing::info_span!(
                "attempt",
                attempt,
                id = %Uuid::new_v4(),
                credential = index
            );
            let report = self.run_attempt(&credential, audio).instrument(span).await;

            if report.turn_completed {
                budget.reset();
            }

            if !self.state.is_active() {
                break;
            }

            let (kind, error) = match report.outcome {
                AttemptOutcome::Stopped | AttemptOutcome::Cancelled => {
                    if self.state.is_active() {
                        (FailureKind::Other, Error::Transport("attempt cancelled".to_string()))
                    } else {
                        break;
                    }
                }
                AttemptOutcome::VoiceChange => {
                    tracing::info!(voice = %self.state.voice(), "reconnecting with new voice");
                    continue;
                }
                AttemptOutcome::GoAway => {
                    tracing::info!("reconnecting after go-away");
                    continue;
                }
                AttemptOutcome::WatchdogTimeout => (
                    FailureKind::Watchdog,
                    Error::Transport("no progress while processing".to_string()),
                ),
                AttemptOutcome::Closed => (
                    FailureKind::Other,
                    Error::Transport("connection closed by remote".to_string()),
                ),
                AttemptOutcome::Failed(e) if e.is_conflict() => {
                    self.credentials.mark_conflict(Instant::now());
                    self.state.clear_resumption_token();
                    (FailureKind::Conflict, e)
                }
                AttemptOutcome::Failed(e) => (FailureKind::Other, e),
            };

            match budget.record(&self.policy, kind) {
                Some(delay) => {
                    tracing::warn!(
                        error = %error,
                        kind = ?kind,
                        failures = budget.failures(),
                        max_retries = self.policy.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "attempt failed, retrying"
                    );
                    self.state.set_status(SessionStatus::Connecting);
                    if !self.pause(delay).await {
                        break;
                    }
                }
                None => {
                    tracing::error!(error = %error, failures = budget.failures(), "retry budget exhausted");
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    async fn run_attempt(&self, credential: &SecretString, audio: &Arc<AudioIo>) -> AttemptReport {
        self.state.set_status(SessionStatus::Connecting);

        // The new voice is read below, so a pending change is satisfied by this connect
        if self.state.take_voice_change() {
            tracing::debug!(voice = %self.state.voice(), "applying voice change");
        }

        let config = self.connect_config();
        let resumed = config.resumption_token.is_some();
        let cancel = self.state.shutdown_token().child_token();

        let connection = tokio::select! {
            () = cancel.cancelled() => return AttemptReport::new(AttemptOutcome::Cancelled),
            connection = self.connector.connect(credential, &config) => connection,
        };

        let connection = match connection {
            Ok(connection) => connection,
            Err(e) => return AttemptReport::new(AttemptOutcome::Failed(e)),
        };

        tracing::info!(resumed, voice = %config.voice, "connected");
        self.state.set_status(SessionStatus::Listening);

        let ctx = AttemptContext {
            state: Arc::clone(&self.state),
            audio: Arc::clone(audio),
            dispatcher: Arc::clone(&self.dispatcher),
            history: Arc::clone(&self.history),
            send_cooldown: self.config.send_cooldown,
            watchdog: Watchdog::new(self.config.watchdog_threshold, self.config.watchdog_interval),
            join_timeout: self.config.join_timeout,
        };

        let report = ctx.run(connection, cancel).await;
        tracing::info!(outcome = ?report.outcome, turn_completed = report.turn_completed, "attempt ended");
        report
    }

    /// Connect configuration for the next attempt
    ///
    /// Without a resumption token the recent history is appended to the system
    /// instruction instead.
    fn connect_config(&self) -> ConnectConfig {
        let resumption_token = self.state.resumption_token();

        let mut system_instruction = self.config.system_prompt.clone();
        if resumption_token.is_none() {
            let context = self
                .history
                .lock()
                .ok()
                .and_then(|history| history.context_block());
            if let Some(context) = context {
                system_instruction.push_str("\n\n");
                system_instruction.push_str(&context);
            }
        }

        ConnectConfig {
            model: self.config.model.clone(),
            voice: self.state.voice(),
            system_instruction,
            tools: self.dispatcher.schemas(),
            resumption_token,
            compression: self.config.compression,
            input_transcription: self.config.input_transcription,
            output_transcription: self.config.output_transcription,
            google_search: self.config.google_search,
            input_sample_rate: self.audio_config.input_sample_rate,
            connect_timeout: self.config.connect_timeout,
        }
    }

    /// Sleep unless the session shuts down first; returns false on shutdown
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.state.shutdown_token().cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Cloneable control handle for a running session
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<SessionState>,
    history: Arc<Mutex<HistoryBuffer>>,
}

impl SessionHandle {
    /// Ask the session to stop
    pub fn stop(&self) {
        self.state.deactivate();
    }

    /// Switch to another voice, reconnecting when the current turn ends
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the voice is not supported
    pub fn change_voice(&self, voice: &str) -> Result<()> {
        if !SUPPORTED_VOICES.contains(&voice) {
            return Err(Error::Config(format!(
                "unsupported voice {voice:?}; expected one of {}",
                SUPPORTED_VOICES.join(", ")
            )));
        }
        self.state.request_voice_change(voice);
        Ok(())
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.state.subscribe()
    }

    /// Whether the session is running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Voice used for the next connection
    #[must_use]
    pub fn voice(&self) -> String {
        self.state.voice()
    }

    /// Token the next connection would resume with
    #[must_use]
    pub fn resumption_token(&self) -> Option<String> {
        self.state.resumption_token()
    }

    /// Snapshot of the recent conversation
    #[must_use]
    pub fn history(&self) -> HistoryBuffer {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_else(|_| HistoryBuffer::new(0))
    }

    /// Shared state, for embedding the engine in a larger application
    #[must_use]
    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }
}
