//! TOML configuration file loading
//!
//! Supports `~/.config/duplex-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Session engine tuning
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Audio hardware configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// API credentials for the dialogue endpoint
    #[serde(default)]
    pub credentials: CredentialsFileConfig,
}

/// Session engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// WebSocket endpoint of the dialogue service
    pub endpoint: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.5-flash-native-audio-preview-12-2025")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Puck")
    pub voice: Option<String>,

    /// System instruction sent on every connect
    pub system_prompt: Option<String>,

    pub max_retries: Option<u32>,
    pub credential_cooldown_secs: Option<u64>,
    pub all_cooldown_wait_secs: Option<u64>,
    pub conflict_backoff_base_secs: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub watchdog_threshold_secs: Option<u64>,
    pub watchdog_interval_ms: Option<u64>,
    pub send_cooldown_ms: Option<u64>,
    pub join_timeout_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub history_turns: Option<usize>,
    pub compression_trigger_tokens: Option<u32>,
    pub compression_target_tokens: Option<u32>,
    pub input_transcription: Option<bool>,
    pub output_transcription: Option<bool>,
    pub google_search: Option<bool>,
}

/// Audio hardware configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
    pub chunk_size: Option<usize>,
    pub playback_queue_capacity: Option<usize>,
    pub max_playback_failures: Option<u32>,
    pub max_capture_failures: Option<u32>,
}

/// Credentials configuration
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsFileConfig {
    /// API keys, rotated in order on session conflicts
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<VoiceConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/duplex-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("duplex-voice").join("config.toml"))
}
