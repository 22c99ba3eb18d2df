//! Session lifecycle state machine
//!
//! One state per device channel. Transitions are validated here; the session
//! worker is the only writer. Invalid edges surface as `StateConflict`
//! rather than panicking, so protocol misuse can never take a session down.

use serde::Serialize;

use crate::{Error, Result};

/// Lifecycle state of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No channel established (also the terminal state after close)
    Idle,
    /// Segmenter active, no utterance open
    Listening,
    /// Accumulating an utterance between boundaries
    BufferingUtterance,
    /// ASR/LLM/TTS pipeline active for the current turn
    RunningTurn,
    /// Reply audio streaming out
    Speaking,
    /// Barge-in or stop received mid-reply, awaiting disposition
    Interrupted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::BufferingUtterance => "buffering_utterance",
            Self::RunningTurn => "running_turn",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{name}")
    }
}

impl SessionState {
    /// Whether moving to `next` is a legal edge
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        // Channel close is legal from anywhere and terminal
        if next == Self::Idle {
            return true;
        }

        matches!(
            (self, next),
            (Self::Idle, Self::Listening)
                | (Self::Listening, Self::BufferingUtterance)
                | (Self::BufferingUtterance, Self::RunningTurn | Self::Listening)
                | (
                    Self::RunningTurn,
                    Self::Speaking
                        | Self::Listening
                        | Self::BufferingUtterance
                        | Self::Interrupted
                )
                | (Self::Speaking, Self::Interrupted | Self::Listening)
                | (
                    Self::Interrupted,
                    Self::BufferingUtterance | Self::Speaking | Self::Listening
                )
        )
    }

    /// Validate and apply a transition
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateConflict`] when the edge is not in the
    /// transition table; the state is left unchanged.
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if !self.can_transition(next) {
            return Err(Error::StateConflict(format!(
                "illegal transition {self} -> {next}"
            )));
        }
        tracing::debug!(from = %self, to = %next, "session transition");
        *self = next;
        Ok(())
    }
}
