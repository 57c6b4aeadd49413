//! WebSocket connector for the live dialogue endpoint

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::protocol::{self, Inbound};
use super::{ConnectConfig, Connection, Connector, ServerEvent, TransportSink};
use crate::audio::AudioFrame;
use crate::tools::ToolCallResponse;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `BidiGenerateContent` WebSocket endpoint
#[derive(Debug, Clone)]
pub struct LiveConnector {
    endpoint: String,
}

impl LiveConnector {
    /// Create a connector for `endpoint`
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn url(&self, credential: &SecretString) -> Result<Url> {
        Url::parse_with_params(&self.endpoint, &[("key", credential.expose_secret())])
            .map_err(|e| Error::Config(format!("invalid endpoint {}: {e}", self.endpoint)))
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, credential: &SecretString, config: &ConnectConfig) -> Result<Connection> {
        let url = self.url(credential)?;

        tracing::debug!(
            model = %config.model,
            voice = %config.voice,
            resuming = config.resumption_token.is_some(),
            tools = config.tools.len(),
            "opening live session"
        );

        let (ws, _response) = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Connect("handshake timed out".to_string()))?
            .map_err(classify_handshake)?;

        let (mut write, mut read) = ws.split();

        write
            .send(Message::text(protocol::setup_message(config)))
            .await
            .map_err(|e| Error::Connect(format!("failed to send setup: {e}")))?;

        tokio::time::timeout(config.connect_timeout, await_setup(&mut read))
            .await
            .map_err(|_| Error::Connect("timed out waiting for setup to complete".to_string()))??;

        tracing::debug!("live session ready");

        Ok(Connection {
            sink: Box::new(LiveSink { write }),
            events: event_stream(read),
        })
    }
}

/// Wait for `setupComplete`, failing on close or error
async fn await_setup(read: &mut SplitStream<WsStream>) -> Result<()> {
    while let Some(message) = read.next().await {
        let message = message.map_err(|e| Error::Connect(e.to_string()))?;
        match decode_message(message) {
            Decoded::Inbound(Inbound::SetupComplete) => return Ok(()),
            Decoded::Inbound(Inbound::Events(events)) => {
                tracing::debug!(count = events.len(), "ignoring events before setup completed");
            }
            Decoded::Error(e) if e.is_conflict() => return Err(e),
            Decoded::Error(e) => return Err(Error::Connect(e.to_string())),
            Decoded::Closed(None) => break,
            Decoded::Closed(Some(e)) if e.is_conflict() => return Err(e),
            Decoded::Closed(Some(e)) => return Err(Error::Connect(e.to_string())),
            Decoded::Skip => {}
        }
    }
    Err(Error::Connect("connection closed during setup".to_string()))
}

/// Map a handshake failure, recognising conflicts in the HTTP response
fn classify_handshake(error: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();

            if status == 409 || status == 429 || crate::error::is_conflict_text(&body) {
                Error::Conflict(format!("HTTP {status}: {body}"))
            } else {
                Error::Connect(format!("HTTP {status}: {body}"))
            }
        }
        other => Error::Connect(other.to_string()),
    }
}

enum Decoded {
    Inbound(Inbound),
    Error(Error),
    Closed(Option<Error>),
    Skip,
}

fn decode_message(message: Message) -> Decoded {
    let decoded = match message {
        Message::Text(text) => protocol::decode(text.as_str()),
        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => protocol::decode(text),
            Err(e) => Err(Error::Protocol(format!("binary message is not UTF-8: {e}"))),
        },
        Message::Close(frame) => return Decoded::Closed(close_error(frame.as_ref())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Decoded::Skip,
    };

    match decoded {
        Ok(inbound) => Decoded::Inbound(inbound),
        Err(e) => Decoded::Error(e),
    }
}

fn close_error(frame: Option<&CloseFrame>) -> Option<Error> {
    let frame = frame?;
    protocol::close_error(u16::from(frame.code), frame.reason.as_str())
}

struct StreamState {
    read: SplitStream<WsStream>,
    pending: VecDeque<ServerEvent>,
    done: bool,
}

/// Turn the read half into a stream of events, one message at a time
fn event_stream(read: SplitStream<WsStream>) -> super::EventStream {
    let state = StreamState {
        read,
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }

            let Some(message) = state.read.next().await else {
                tracing::debug!("live session stream ended");
                return None;
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    state.done = true;
                    return Some((Err(Error::Transport(e.to_string())), state));
                }
            };

            match decode_message(message) {
                Decoded::Inbound(Inbound::Events(events)) => state.pending.extend(events),
                Decoded::Inbound(Inbound::SetupComplete) | Decoded::Skip => {}
                Decoded::Error(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                Decoded::Closed(error) => {
                    state.done = true;
                    tracing::debug!(clean = error.is_none(), "live session closed by remote");
                    if let Some(e) = error {
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
    .boxed()
}

struct LiveSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for LiveSink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        self.write
            .send(Message::text(protocol::audio_message(frame)))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn send_tool_responses(&mut self, responses: &[ToolCallResponse]) -> Result<()> {
        self.write
            .send(Message::text(protocol::tool_response_message(responses)))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        match self.write.close().await {
            Ok(())
            | Err(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed,
            ) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
