//! Tool dispatch for remote tool calls
//!
//! The tool catalog itself lives outside the engine. The engine only needs a
//! [`ToolDispatcher`]: something that can describe its tools and execute one call
//! synchronously. Failures never end a session; they become the tool's result text.

mod clock;
mod registry;
mod schema;
mod session;

use serde::{Deserialize, Serialize};

pub use clock::CurrentTimeTool;
pub use registry::{Tool, ToolRegistry};
pub use schema::{ArgValue, ParamKind, ParamSpec, ToolSchema, TypedArgs};
pub use session::{CHANGE_VOICE_TOOL, EXIT_TOOL, SessionTools};

/// Longest tool result forwarded to the remote service
pub const MAX_RESULT_CHARS: usize = 10_000;

/// Raw argument map as received from the remote service
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// A tool invocation requested by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: ToolArgs,
}

/// The result of one tool invocation, sent back to the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    pub result: String,
}

/// Tool-level failure, reported back as the tool's textual result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    MissingArgument(String),

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Executes tool calls on behalf of the session engine
///
/// Implementations run synchronously; the engine calls them off the async scheduler.
pub trait ToolDispatcher: Send + Sync {
    /// Tools offered to the remote service on connect
    fn schemas(&self) -> Vec<ToolSchema>;

    /// Execute one tool call
    ///
    /// # Errors
    ///
    /// Returns a `ToolError` when the tool is unknown, the arguments do not match its
    /// schema, or the tool itself fails
    fn execute(&self, name: &str, args: &ToolArgs) -> Result<String, ToolError>;
}

/// Run one call through a dispatcher and turn the outcome into a response
///
/// Errors become the result text and long results are truncated.
pub fn respond(dispatcher: &dyn ToolDispatcher, call: &ToolCallRequest) -> ToolCallResponse {
    let result = match dispatcher.execute(&call.name, &call.args) {
        Ok(result) => {
            tracing::debug!(tool = %call.name, id = %call.id, "tool succeeded");
            truncate_result(result)
        }
        Err(e) => {
            tracing::warn!(tool = %call.name, id = %call.id, error = %e, "tool failed");
            format!("Error executing {}: {e}", call.name)
        }
    };

    ToolCallResponse {
        id: call.id.clone(),
        name: call.name.clone(),
        result,
    }
}

fn truncate_result(mut result: String) -> String {
    if let Some((idx, _)) = result.char_indices().nth(MAX_RESULT_CHARS) {
        result.truncate(idx);
        result.push_str("... (truncated)");
    }
    result
}
