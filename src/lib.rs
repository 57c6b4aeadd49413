//! Duplex Voice - real-time voice session engine
//!
//! Keeps a live bidirectional audio, text and tool-call stream open against a
//! remote dialogue endpoint while capturing the microphone, playing synthesized
//! speech, running tool calls and recovering from dropped connections, conflicting
//! sessions and stuck turns.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               SessionOrchestrator                │
//! │  credentials │ retry budget │ history │ handle   │
//! └────────────────────────┬─────────────────────────┘
//!                          │ one attempt at a time
//! ┌────────────────────────▼─────────────────────────┐
//! │                     Attempt                      │
//! │  send │ receive │ playback drain │ watchdog      │
//! └──────┬──────────────────┬────────────────┬───────┘
//!        │                  │                │
//! ┌──────▼───────┐ ┌────────▼───────┐ ┌──────▼─────────┐
//! │   AudioIo    │ │   Transport    │ │ ToolDispatcher │
//! │ cpal threads │ │   WebSocket    │ │ typed schemas  │
//! └──────────────┘ └────────────────┘ └────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionHandle, SessionOrchestrator, SessionState, SessionStatus};
pub use tools::{Tool, ToolDispatcher, ToolRegistry};
pub use transport::{Connector, LiveConnector, ServerEvent};
