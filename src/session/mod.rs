//! Duplex voice session engine
//!
//! The orchestrator owns the retry loop; each connection attempt runs its send,
//! receive, playback and watchdog tasks against one [`SessionState`].

mod attempt;
mod credentials;
mod history;
mod orchestrator;
mod retry;
mod state;
mod watchdog;

pub use attempt::{AttemptOutcome, AttemptReport};
pub use credentials::CredentialPool;
pub use history::{HistoryBuffer, HistoryTurn, Speaker, TranscriptCollector};
pub use orchestrator::{SessionHandle, SessionOrchestrator};
pub use retry::{FailureKind, RetryBudget, RetryPolicy};
pub use state::{SessionState, SessionStatus, ToolBatch};
pub use watchdog::Watchdog;
