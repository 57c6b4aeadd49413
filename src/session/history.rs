//! Bounded conversation history
//!
//! Used to seed the system instruction when a session cannot be resumed.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};

/// Who spoke a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

/// One recorded utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// FIFO of the most recent turns
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    turns: VecDeque<HistoryTurn>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create a buffer holding at most `capacity` turns
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a turn, evicting the oldest when full
    ///
    /// Blank text is ignored.
    pub fn push(&mut self, speaker: Speaker, text: &str) {
        let text = text.trim();
        if text.is_empty() || self.capacity == 0 {
            return;
        }

        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(HistoryTurn {
            speaker,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Recorded turns, oldest first
    pub fn turns(&self) -> impl Iterator<Item = &HistoryTurn> {
        self.turns.iter()
    }

    /// Number of recorded turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render the history as a block appended to the system instruction
    ///
    /// Returns `None` when the history is empty.
    #[must_use]
    pub fn context_block(&self) -> Option<String> {
        if self.turns.is_empty() {
            return None;
        }

        let mut block = String::from("[RECENT CONVERSATION HISTORY (Session Restored)]\n");
        for turn in &self.turns {
            block.push_str(&format!("{}: {}\n", turn.speaker, turn.text));
        }
        block.push_str("[End of History]");
        Some(block)
    }
}

/// Collects transcript fragments for the turn in progress
///
/// Transcripts stream in small pieces; they are joined and committed to the
/// history once the turn ends. Output transcripts take precedence over model text
/// parts, which carry the same utterance when both are enabled.
#[derive(Debug, Default)]
pub struct TranscriptCollector {
    user: String,
    transcript: String,
    model_text: String,
}

impl TranscriptCollector {
    /// Add a fragment of the user's speech
    pub fn push_input(&mut self, fragment: &str) {
        self.user.push_str(fragment);
    }

    /// Add a fragment of the assistant's speech
    pub fn push_output(&mut self, fragment: &str) {
        self.transcript.push_str(fragment);
    }

    /// Add a text part of the model's turn
    pub fn push_model_text(&mut self, fragment: &str) {
        self.model_text.push_str(fragment);
    }

    /// Commit the collected turn to `history` and reset
    pub fn flush(&mut self, history: &mut HistoryBuffer) {
        history.push(Speaker::User, &self.user);
        let assistant = if self.transcript.trim().is_empty() {
            &self.model_text
        } else {
            &self.transcript
        };
        history.push(Speaker::Assistant, assistant);

        self.user.clear();
        self.transcript.clear();
        self.model_text.clear();
    }
}
