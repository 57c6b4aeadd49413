//! Session control tools
//!
//! Two tools act on the engine itself rather than the outside world: ending the
//! session and switching the voice. They are layered over any other dispatcher.

use std::sync::Arc;

use super::{ParamKind, ParamSpec, ToolArgs, ToolDispatcher, ToolError, ToolSchema};
use crate::config::SUPPORTED_VOICES;
use crate::session::SessionState;

/// Tool that ends the session
pub const EXIT_TOOL: &str = "exit_session";

/// Tool that reconnects with a different voice
pub const CHANGE_VOICE_TOOL: &str = "change_voice";

/// Dispatcher that handles session control tools and delegates everything else
pub struct SessionTools {
    inner: Arc<dyn ToolDispatcher>,
    state: Arc<SessionState>,
    exit: ToolSchema,
    change_voice: ToolSchema,
}

impl SessionTools {
    /// Layer session control tools over `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn ToolDispatcher>, state: Arc<SessionState>) -> Self {
        Self {
            inner,
            state,
            exit: ToolSchema::new(
                EXIT_TOOL,
                "End the voice session when the user says goodbye or asks to stop",
            ),
            change_voice: ToolSchema::new(CHANGE_VOICE_TOOL, "Switch to a different speaking voice")
                .param(
                    ParamSpec::required("voice_name", ParamKind::String, "Name of the voice")
                        .one_of(SUPPORTED_VOICES),
                ),
        }
    }
}

impl ToolDispatcher for SessionTools {
    fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = vec![self.exit.clone(), self.change_voice.clone()];
        schemas.extend(
            self.inner
                .schemas()
                .into_iter()
                .filter(|s| s.name != EXIT_TOOL && s.name != CHANGE_VOICE_TOOL),
        );
        schemas
    }

    fn execute(&self, name: &str, args: &ToolArgs) -> Result<String, ToolError> {
        match name {
            EXIT_TOOL => {
                tracing::info!("exit requested by remote service");
                self.state.deactivate();
                Ok("Goodbye! Going to standby.".to_string())
            }
            CHANGE_VOICE_TOOL => {
                let typed = self.change_voice.validate(args)?;
                let voice = typed
                    .str("voice_name")
                    .ok_or_else(|| ToolError::MissingArgument("voice_name".to_string()))?;
                self.state.request_voice_change(voice);
                Ok(format!("Switching to {voice}."))
            }
            _ => self.inner.execute(name, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::ToolRegistry;

    fn tools() -> (SessionTools, Arc<SessionState>) {
        let state = Arc::new(SessionState::new("Puck"));
        state.activate();
        let tools = SessionTools::new(Arc::new(ToolRegistry::with_builtins()), Arc::clone(&state));
        (tools, state)
    }

    #[test]
    fn advertises_control_and_inner_tools() {
        let (tools, _) = tools();
        let names: Vec<String> = tools.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![EXIT_TOOL, CHANGE_VOICE_TOOL, "current_time"]);
    }

    #[test]
    fn exit_deactivates() {
        let (tools, state) = tools();
        let result = tools.execute(EXIT_TOOL, &ToolArgs::new()).unwrap();
        assert_eq!(result, "Goodbye! Going to standby.");
        assert!(!state.is_active());
    }

    #[test]
    fn change_voice_requests_reconnect() {
        let (tools, state) = tools();
        let args = json!({"voice_name": "Fenrir"}).as_object().cloned().unwrap();
        let result = tools.execute(CHANGE_VOICE_TOOL, &args).unwrap();
        assert_eq!(result, "Switching to Fenrir.");
        assert_eq!(state.voice(), "Fenrir");
        assert!(state.voice_change_pending());
    }

    #[test]
    fn unsupported_voice_rejected() {
        let (tools, state) = tools();
        let args = json!({"voice_name": "Robot"}).as_object().cloned().unwrap();
        assert!(tools.execute(CHANGE_VOICE_TOOL, &args).is_err());
        assert_eq!(state.voice(), "Puck");
        assert!(!state.voice_change_pending());
    }

    #[test]
    fn other_tools_delegated() {
        let (tools, _) = tools();
        assert!(tools.execute("current_time", &ToolArgs::new()).is_ok());
        assert_eq!(
            tools.execute("launch_rocket", &ToolArgs::new()).unwrap_err(),
            ToolError::Unknown("launch_rocket".to_string())
        );
    }
}
