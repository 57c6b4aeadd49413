//! Configuration management for the voice session engine
//!
//! Values resolve with precedence env > TOML file > defaults.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Default dialogue endpoint (Gemini Live bidirectional streaming)
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Puck";

/// Prebuilt voices accepted by the dialogue service
pub const SUPPORTED_VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede"];

/// Default system instruction
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a personal voice assistant. \
Be direct, efficient and helpful. Speak concisely in a natural conversational tone, \
and use the available tools whenever they can answer the request.";

/// Environment variables scanned for API keys, in rotation order
const CREDENTIAL_ENV_VARS: &[&str] = &["GEMINI_API_KEY_1", "GEMINI_API_KEY_2", "GEMINI_API_KEY"];

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API keys for the dialogue endpoint, rotated on conflicts
    pub credentials: Vec<SecretString>,

    /// Session engine tuning
    pub session: SessionConfig,

    /// Audio hardware configuration
    pub audio: AudioConfig,
}

/// Session engine configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the dialogue service
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Initial prebuilt voice
    pub voice: String,

    /// System instruction sent on every connect
    pub system_prompt: String,

    /// Reconnects allowed before the engine gives up
    pub max_retries: u32,

    /// How long a credential stays unusable after a conflict
    pub credential_cooldown: Duration,

    /// Sleep before clearing cooldowns when every credential is cooling down
    pub all_cooldown_wait: Duration,

    /// Base of the exponential backoff applied after conflicts
    pub conflict_backoff_base: Duration,

    /// Fixed delay applied after non-conflict failures
    pub retry_delay: Duration,

    /// Time stuck in PROCESSING before the watchdog forces a reconnect
    pub watchdog_threshold: Duration,

    /// Watchdog check interval
    pub watchdog_interval: Duration,

    /// Echo suppression window after each completed turn
    pub send_cooldown: Duration,

    /// Bound on joining attempt tasks after cancellation
    pub join_timeout: Duration,

    /// Bound on the connect handshake
    pub connect_timeout: Duration,

    /// Turns kept to seed context when a session cannot be resumed
    pub history_turns: usize,

    /// Context window compression thresholds
    pub compression: CompressionConfig,

    /// Ask the service to transcribe user speech
    pub input_transcription: bool,

    /// Ask the service to transcribe model speech
    pub output_transcription: bool,

    /// Enable the service-side search tool
    pub google_search: bool,
}

/// Sliding-window context compression thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Token count that triggers compression
    pub trigger_tokens: u32,

    /// Token count the sliding window compresses down to
    pub target_tokens: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: 25_600,
            target_tokens: 12_800,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_retries: 3,
            credential_cooldown: Duration::from_secs(60),
            all_cooldown_wait: Duration::from_secs(60),
            conflict_backoff_base: Duration::from_secs(2),
            retry_delay: Duration::from_secs(1),
            watchdog_threshold: Duration::from_secs(25),
            watchdog_interval: Duration::from_secs(1),
            send_cooldown: Duration::from_millis(800),
            join_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
            history_turns: 20,
            compression: CompressionConfig::default(),
            input_transcription: true,
            output_transcription: true,
            google_search: true,
        }
    }
}

/// Audio hardware configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Capture sample rate (Hz)
    pub input_sample_rate: u32,

    /// Playback sample rate (Hz)
    pub output_sample_rate: u32,

    /// Samples per captured frame
    pub chunk_size: usize,

    /// Frames buffered for playback before the oldest is dropped
    pub playback_queue_capacity: usize,

    /// Consecutive playback write failures before the attempt is torn down
    pub max_playback_failures: u32,

    /// Consecutive capture read failures before capture gives up
    pub max_capture_failures: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            chunk_size: 1024,
            playback_queue_capacity: 512,
            max_playback_failures: 5,
            max_capture_failures: 5,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// An explicit `path` must exist and parse; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly requested config file cannot be loaded
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        Ok(Self::from_sources(fc, |key| std::env::var(key).ok()))
    }

    /// Resolve configuration from a parsed file and an environment lookup
    #[must_use]
    pub fn from_sources(fc: file::VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SessionConfig::default();
        let s = fc.session;

        let secs = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_secs);
        let millis = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_millis);

        let credential_cooldown = secs(s.credential_cooldown_secs, defaults.credential_cooldown);

        let session = SessionConfig {
            endpoint: env("DUPLEX_VOICE_ENDPOINT")
                .or(s.endpoint)
                .unwrap_or(defaults.endpoint),
            model: env("DUPLEX_VOICE_MODEL").or(s.model).unwrap_or(defaults.model),
            voice: env("DUPLEX_VOICE_VOICE").or(s.voice).unwrap_or(defaults.voice),
            system_prompt: s.system_prompt.unwrap_or(defaults.system_prompt),
            max_retries: s.max_retries.unwrap_or(defaults.max_retries),
            credential_cooldown,
            // Waiting a full cooldown window guarantees no credential is reused early
            all_cooldown_wait: secs(s.all_cooldown_wait_secs, credential_cooldown),
            conflict_backoff_base: secs(
                s.conflict_backoff_base_secs,
                defaults.conflict_backoff_base,
            ),
            retry_delay: millis(s.retry_delay_ms, defaults.retry_delay),
            watchdog_threshold: secs(s.watchdog_threshold_secs, defaults.watchdog_threshold),
            watchdog_interval: millis(s.watchdog_interval_ms, defaults.watchdog_interval),
            send_cooldown: millis(s.send_cooldown_ms, defaults.send_cooldown),
            join_timeout: millis(s.join_timeout_ms, defaults.join_timeout),
            connect_timeout: secs(s.connect_timeout_secs, defaults.connect_timeout),
            history_turns: s.history_turns.unwrap_or(defaults.history_turns),
            compression: CompressionConfig {
                trigger_tokens: s
                    .compression_trigger_tokens
                    .unwrap_or(defaults.compression.trigger_tokens),
                target_tokens: s
                    .compression_target_tokens
                    .unwrap_or(defaults.compression.target_tokens),
            },
            input_transcription: s.input_transcription.unwrap_or(defaults.input_transcription),
            output_transcription: s
                .output_transcription
                .unwrap_or(defaults.output_transcription),
            google_search: s.google_search.unwrap_or(defaults.google_search),
        };

        let audio_defaults = AudioConfig::default();
        let a = fc.audio;
        let audio = AudioConfig {
            input_sample_rate: a.input_sample_rate.unwrap_or(audio_defaults.input_sample_rate),
            output_sample_rate: a
                .output_sample_rate
                .unwrap_or(audio_defaults.output_sample_rate),
            chunk_size: a.chunk_size.unwrap_or(audio_defaults.chunk_size),
            playback_queue_capacity: a
                .playback_queue_capacity
                .unwrap_or(audio_defaults.playback_queue_capacity),
            max_playback_failures: a
                .max_playback_failures
                .unwrap_or(audio_defaults.max_playback_failures),
            max_capture_failures: a
                .max_capture_failures
                .unwrap_or(audio_defaults.max_capture_failures),
        };

        // Env keys first, then file keys; duplicates collapse onto the first slot
        let mut keys: Vec<String> = Vec::new();
        for key in CREDENTIAL_ENV_VARS
            .iter()
            .filter_map(|var| env(var))
            .chain(fc.credentials.keys)
        {
            let key = key.trim().to_string();
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }

        Self {
            credentials: keys.into_iter().map(SecretString::from).collect(),
            session,
            audio,
        }
    }

    /// Check the configuration is usable for a live session
    ///
    /// # Errors
    ///
    /// Returns error if no credentials are configured or a value is out of range
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(Error::Config(format!(
                "no API keys configured; set one of {} or [credentials] keys",
                CREDENTIAL_ENV_VARS.join(", ")
            )));
        }

        if !SUPPORTED_VOICES.contains(&self.session.voice.as_str()) {
            return Err(Error::Config(format!(
                "unsupported voice {:?}; expected one of {}",
                self.session.voice,
                SUPPORTED_VOICES.join(", ")
            )));
        }

        if self.audio.chunk_size == 0 || self.audio.playback_queue_capacity == 0 {
            return Err(Error::Config(
                "audio chunk_size and playback_queue_capacity must be non-zero".to_string(),
            ));
        }

        if self.session.compression.target_tokens >= self.session.compression.trigger_tokens {
            return Err(Error::Config(
                "compression target_tokens must be below trigger_tokens".to_string(),
            ));
        }

        Ok(())
    }
}
