//! Error types for the duplex voice engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice session engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio hardware error (capture or playback device)
    #[error("audio error: {0}")]
    Audio(String),

    /// Another session already owns this identity
    #[error("session conflict: {0}")]
    Conflict(String),

    /// Connection could not be established
    #[error("connect error: {0}")]
    Connect(String),

    /// Established channel failed or was closed
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote endpoint sent something we could not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error belongs to the conflict class
    ///
    /// Conflicts trigger credential rotation and clear the resumption token
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Classify a remote error by its code and message
    ///
    /// HTTP 409, `CONFLICT` and `RESOURCE_EXHAUSTED` mean another session holds the
    /// identity; everything else is a plain transport failure.
    #[must_use]
    pub fn from_remote(code: Option<i64>, message: &str) -> Self {
        if code == Some(409) || is_conflict_text(message) {
            Self::Conflict(message.to_string())
        } else {
            match code {
                Some(code) => Self::Transport(format!("remote error {code}: {message}")),
                None => Self::Transport(message.to_string()),
            }
        }
    }
}

/// Whether free-form error text indicates a session conflict
#[must_use]
pub fn is_conflict_text(text: &str) -> bool {
    let upper = text.to_uppercase();
    upper.contains("409") || upper.contains("CONFLICT") || upper.contains("RESOURCE_EXHAUSTED")
}
