//! Connection to the remote dialogue endpoint
//!
//! A [`Connector`] opens one duplex session per attempt and splits it into an
//! outbound [`TransportSink`] and an inbound stream of [`ServerEvent`]s. The stream
//! ends when the remote closes normally and yields an error otherwise; conflict
//! errors are distinguishable through [`crate::Error::is_conflict`].

mod live;
pub mod protocol;

use async_trait::async_trait;
use futures::stream::BoxStream;
use secrecy::SecretString;
use tokio::time::Duration;

pub use live::LiveConnector;

use crate::Result;
use crate::audio::AudioFrame;
use crate::config::{CompressionConfig, DEFAULT_MODEL, DEFAULT_VOICE};
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolSchema};

/// Event received from the remote dialogue service
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A chunk of synthesized speech
    ModelAudio(AudioFrame),
    /// A text part of the model's turn
    ModelText(String),
    /// The model finished its turn
    TurnComplete,
    /// The user barged in; pending playback is stale
    Interrupted,
    /// The model requests a batch of tool calls
    ToolCall(Vec<ToolCallRequest>),
    /// The model withdrew earlier tool calls
    ToolCallCancellation(Vec<String>),
    /// New token for resuming this conversation on a later connection
    ///
    /// `None` means the session is no longer resumable and any held token is stale.
    ResumptionUpdate(Option<String>),
    /// Transcript fragment of the user's speech
    InputTranscript(String),
    /// Transcript fragment of the model's speech
    OutputTranscript(String),
    /// The server will close this connection soon
    GoAway(Option<String>),
}

/// Everything needed to open one session
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Tools offered to the model
    pub tools: Vec<ToolSchema>,
    /// Resume a previous conversation instead of starting fresh
    pub resumption_token: Option<String>,
    pub compression: CompressionConfig,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub google_search: bool,
    /// Rate advertised for outbound microphone audio
    pub input_sample_rate: u32,
    /// Bound on the handshake and setup exchange
    pub connect_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: String::new(),
            tools: Vec::new(),
            resumption_token: None,
            compression: CompressionConfig::default(),
            input_transcription: true,
            output_transcription: true,
            google_search: false,
            input_sample_rate: 16_000,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Outbound half of a connection
#[async_trait]
pub trait TransportSink: Send {
    /// Send one microphone frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the connection is closed
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Send the results of a tool call batch
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the connection is closed
    async fn send_tool_responses(&mut self, responses: &[ToolCallResponse]) -> Result<()>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake fails
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection
pub type EventStream = BoxStream<'static, Result<ServerEvent>>;

/// An established session
pub struct Connection {
    pub sink: Box<dyn TransportSink>,
    pub events: EventStream,
}

/// Opens sessions against the dialogue service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session with `credential`
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` when another session holds the credential and
    /// `Error::Connect` for any other failure
    async fn connect(&self, credential: &SecretString, config: &ConnectConfig) -> Result<Connection>;
}
