//! JSON messages exchanged with the live dialogue endpoint
//!
//! Outbound: `setup`, `realtimeInput`, `toolResponse`.
//! Inbound: `setupComplete`, `serverContent`, `toolCall`, `toolCallCancellation`,
//! `sessionResumptionUpdate`, `goAway` and `error`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{ConnectConfig, ServerEvent};
use crate::audio::AudioFrame;
use crate::tools::{ToolCallRequest, ToolCallResponse, ToolSchema};
use crate::{Error, Result};

/// Sample rate assumed for model audio without a `rate=` hint
pub const DEFAULT_MODEL_AUDIO_RATE: u32 = 24_000;

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The setup message was accepted
    SetupComplete,
    /// Session events, in the order they must be processed
    Events(Vec<ServerEvent>),
}

// -- outbound -----------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: Value,
    system_instruction: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Value>,
    context_window_compression: Value,
    session_resumption: Value,
}

/// Build the `setup` message that opens a session
#[must_use]
pub fn setup_message(config: &ConnectConfig) -> String {
    let mut tools = Vec::new();
    if !config.tools.is_empty() {
        let declarations: Vec<Value> = config.tools.iter().map(function_declaration).collect();
        tools.push(json!({ "functionDeclarations": declarations }));
    }
    if config.google_search {
        tools.push(json!({ "googleSearch": {} }));
    }

    // An empty resumption object asks for handles without resuming
    let session_resumption = config
        .resumption_token
        .as_ref()
        .map_or_else(|| json!({}), |handle| json!({ "handle": handle }));

    let setup = Setup {
        model: config.model.clone(),
        generation_config: json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": config.voice } }
            }
        }),
        system_instruction: json!({ "parts": [{ "text": config.system_instruction }] }),
        tools,
        input_audio_transcription: config.input_transcription.then(|| json!({})),
        output_audio_transcription: config.output_transcription.then(|| json!({})),
        context_window_compression: json!({
            "triggerTokens": config.compression.trigger_tokens,
            "slidingWindow": { "targetTokens": config.compression.target_tokens }
        }),
        session_resumption,
    };

    json!({ "setup": setup }).to_string()
}

/// Render a tool schema as a function declaration
#[must_use]
pub fn function_declaration(schema: &ToolSchema) -> Value {
    let mut properties = Map::new();
    for param in &schema.params {
        let mut property = json!({
            "type": param.kind.wire_name(),
            "description": param.description,
        });
        if !param.allowed.is_empty() {
            property["enum"] = json!(param.allowed);
        }
        properties.insert(param.name.clone(), property);
    }

    let required: Vec<&str> = schema
        .params
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();

    let mut declaration = json!({
        "name": schema.name,
        "description": schema.description,
    });
    if !properties.is_empty() {
        declaration["parameters"] = json!({
            "type": "OBJECT",
            "properties": properties,
            "required": required,
        });
    }
    declaration
}

/// Build a `realtimeInput` message carrying one microphone frame
#[must_use]
pub fn audio_message(frame: &AudioFrame) -> String {
    json!({
        "realtimeInput": {
            "audio": {
                "data": BASE64.encode(&frame.data),
                "mimeType": format!("audio/pcm;rate={}", frame.sample_rate),
            }
        }
    })
    .to_string()
}

/// Build a `toolResponse` message for a batch of results
#[must_use]
pub fn tool_response_message(responses: &[ToolCallResponse]) -> String {
    let function_responses: Vec<Value> = responses
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "response": { "result": r.result },
            })
        })
        .collect();

    json!({ "toolResponse": { "functionResponses": function_responses } }).to_string()
}

// -- inbound ------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMessage>,
    tool_call_cancellation: Option<ToolCallCancellationMessage>,
    session_resumption_update: Option<ResumptionUpdateMessage>,
    go_away: Option<GoAwayMessage>,
    error: Option<ErrorMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    #[serde(default)]
    function_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Deserialize)]
struct ToolCallCancellationMessage {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumptionUpdateMessage {
    new_handle: Option<String>,
    resumable: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayMessage {
    time_left: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    code: Option<i64>,
    #[serde(default)]
    message: String,
    status: Option<String>,
}

/// Decode one inbound JSON message
///
/// # Errors
///
/// Returns `Error::Serialization` for malformed JSON, `Error::Protocol` for
/// undecodable audio, and the classified remote error for `error` messages
pub fn decode(text: &str) -> Result<Inbound> {
    let message: ServerMessage = serde_json::from_str(text)?;

    if let Some(error) = message.error {
        let detail = match error.status {
            Some(status) => format!("{status}: {}", error.message),
            None => error.message,
        };
        return Err(Error::from_remote(error.code, &detail));
    }

    if message.setup_complete.is_some() {
        return Ok(Inbound::SetupComplete);
    }

    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::InputTranscript(t.text));
        }
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(inline) = part.inline_data {
                let data = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|e| Error::Protocol(format!("invalid audio payload: {e}")))?;
                let rate = parse_rate(&inline.mime_type).unwrap_or(DEFAULT_MODEL_AUDIO_RATE);
                events.push(ServerEvent::ModelAudio(AudioFrame::new(data, rate, 1)));
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ServerEvent::ModelText(text));
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::OutputTranscript(t.text));
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(call) = message.tool_call {
        if !call.function_calls.is_empty() {
            events.push(ServerEvent::ToolCall(call.function_calls));
        }
    }

    if let Some(cancel) = message.tool_call_cancellation {
        events.push(ServerEvent::ToolCallCancellation(cancel.ids));
    }

    if let Some(update) = message.session_resumption_update {
        if update.resumable == Some(false) {
            events.push(ServerEvent::ResumptionUpdate(None));
        } else if let Some(handle) = update.new_handle.filter(|h| !h.is_empty()) {
            events.push(ServerEvent::ResumptionUpdate(Some(handle)));
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(ServerEvent::GoAway(go_away.time_left));
    }

    Ok(Inbound::Events(events))
}

/// Classify a close frame
///
/// Returns `None` for a normal close, otherwise the error it reports.
#[must_use]
pub fn close_error(code: u16, reason: &str) -> Option<Error> {
    if code == 1000 && !crate::error::is_conflict_text(reason) {
        return None;
    }

    let reason = if reason.is_empty() {
        "connection closed".to_string()
    } else {
        reason.to_string()
    };
    Some(Error::from_remote(Some(i64::from(code)), &reason))
}

/// Extract the sample rate from a mime type like `audio/pcm;rate=24000`
fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}
