//! Turn identity, cancellation, and retained playback

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::recorder::TurnMetrics;

/// Shared cooperative cancellation flag for one turn
///
/// Set synchronously at the interruption site; observed at every suspension
/// point in the pipeline. Cancellation is cooperative: an in-flight provider
/// call completes and its output is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, unset flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// Created, pipeline not yet producing
    Pending,
    /// Pipeline running
    Active,
    /// All reply audio sent
    Completed,
    /// Interrupted before completion
    Cancelled,
    /// A stage failed or timed out
    Failed,
}

impl TurnStatus {
    /// Whether the turn can no longer change
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One utterance → transcript → reply → audio cycle
///
/// Owned exclusively by the session that spawned it.
#[derive(Debug)]
pub struct Turn {
    /// Turn identifier
    pub id: Uuid,
    /// Position within the session
    pub seq: u64,
    /// Current status
    pub status: TurnStatus,
    /// Cancellation flag shared with the pipeline task
    pub cancel: CancelFlag,
    /// When the turn was spawned
    pub started_at: DateTime<Utc>,
}

impl Turn {
    /// Spawn a new pending turn
    #[must_use]
    pub fn new(seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            status: TurnStatus::Pending,
            cancel: CancelFlag::new(),
            started_at: Utc::now(),
        }
    }
}

/// Reply audio retained for explicit resume
///
/// Every chunk the pipeline produced is kept here; `next_unsent` marks the
/// replay point. After a barge-in the retained tail stays resumable until
/// the retention window lapses or a new utterance boundary arrives.
#[derive(Debug)]
pub struct Playback {
    /// Turn this audio belongs to
    pub turn_id: Uuid,
    /// The turn's position within the session
    pub seq: u64,
    /// Transcript of the utterance that produced this reply
    pub transcript: String,
    /// Full reply text (may still be empty while the turn runs)
    pub reply_text: String,
    /// Pipeline metrics accumulated so far
    pub metrics: TurnMetrics,

    chunks: Vec<Vec<u8>>,
    next_unsent: usize,
    retained_at: Option<Instant>,
}

impl Playback {
    /// Start tracking playback for a turn
    #[must_use]
    pub fn new(turn_id: Uuid, seq: u64, transcript: String) -> Self {
        Self {
            turn_id,
            seq,
            transcript,
            reply_text: String::new(),
            metrics: TurnMetrics::default(),
            chunks: Vec::new(),
            next_unsent: 0,
            retained_at: None,
        }
    }

    /// Record a chunk the pipeline produced
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.chunks.push(chunk);
    }

    /// Mark the next unsent chunk as sent
    pub fn mark_sent(&mut self) {
        self.next_unsent = (self.next_unsent + 1).min(self.chunks.len());
    }

    /// Chunks produced so far
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks already sent to the channel
    #[must_use]
    pub const fn sent_count(&self) -> usize {
        self.next_unsent
    }

    /// Whether any produced chunk is still unsent
    #[must_use]
    pub fn has_unsent(&self) -> bool {
        self.next_unsent < self.chunks.len()
    }

    /// Clone the unsent tail for replay
    #[must_use]
    pub fn unsent_chunks(&self) -> Vec<Vec<u8>> {
        self.chunks[self.next_unsent..].to_vec()
    }

    /// Begin the retention window after an interruption
    pub fn mark_retained(&mut self) {
        self.retained_at = Some(Instant::now());
    }

    /// Whether the retention window has lapsed
    #[must_use]
    pub fn is_expired(&self, retention: Duration) -> bool {
        self.retained_at.is_some_and(|at| at.elapsed() >= retention)
    }
}
