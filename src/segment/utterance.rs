//! Utterance accumulation between VAD boundaries

use chrono::{DateTime, Utc};

use crate::audio::pcm_duration_ms;
use crate::config::{AudioConfig, SegmenterConfig};
use crate::{Error, Result};

/// A completed utterance: PCM bounded by two VAD boundary events
///
/// Immutable once produced by [`UtteranceBuffer::finalize`].
#[derive(Debug, Clone)]
pub struct Utterance {
    started_at: DateTime<Utc>,
    pcm: Vec<u8>,
}

impl Utterance {
    /// When the opening boundary was observed
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Accumulated PCM bytes
    #[must_use]
    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    /// Consume into the raw PCM
    #[must_use]
    pub fn into_pcm(self) -> Vec<u8> {
        self.pcm
    }

    /// Accumulated byte length
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.pcm.len()
    }
}

/// Outcome of an append while inside an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Chunk buffered, utterance still open
    Buffered,
    /// Duration cap reached; the caller should force-finalize now
    DurationExceeded,
}

/// Bounded buffer for the in-progress utterance
///
/// Enforces a byte cap (append fails with [`Error::Capacity`], surfacing
/// backpressure to the session) and a duration cap (append asks the caller
/// to force-finalize).
pub struct UtteranceBuffer {
    pcm: Vec<u8>,
    started_at: Option<DateTime<Utc>>,
    sample_rate: u32,
    max_bytes: usize,
    max_duration_ms: u64,
}

impl UtteranceBuffer {
    /// Create an empty buffer with limits from configuration
    #[must_use]
    pub fn new(audio: &AudioConfig, cfg: &SegmenterConfig) -> Self {
        Self {
            pcm: Vec::new(),
            started_at: None,
            sample_rate: audio.sample_rate,
            max_bytes: cfg.max_buffer_bytes,
            max_duration_ms: cfg.max_utterance_ms,
        }
    }

    /// Whether an utterance is currently open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.started_at.is_some()
    }

    /// Open a new utterance, discarding any previous in-progress audio
    pub fn begin(&mut self) {
        self.pcm.clear();
        self.started_at = Some(Utc::now());
    }

    /// Append a PCM chunk to the open utterance
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] when the byte cap would be exceeded; the
    /// in-progress utterance is discarded and the buffer closed.
    pub fn append(&mut self, chunk: &[u8]) -> Result<AppendResult> {
        if self.started_at.is_none() {
            // Frames between utterances are not buffered
            return Ok(AppendResult::Buffered);
        }

        if self.pcm.len() + chunk.len() > self.max_bytes {
            let attempted = self.pcm.len() + chunk.len();
            self.abort();
            return Err(Error::Capacity(attempted));
        }

        self.pcm.extend_from_slice(chunk);

        if pcm_duration_ms(self.pcm.len(), self.sample_rate) >= self.max_duration_ms {
            return Ok(AppendResult::DurationExceeded);
        }

        Ok(AppendResult::Buffered)
    }

    /// Close the utterance and hand it off
    ///
    /// Returns `None` when no utterance is open or nothing was buffered.
    pub fn finalize(&mut self) -> Option<Utterance> {
        let started_at = self.started_at.take()?;
        if self.pcm.is_empty() {
            return None;
        }

        Some(Utterance {
            started_at,
            pcm: std::mem::take(&mut self.pcm),
        })
    }

    /// Discard the in-progress utterance without emitting it
    pub fn abort(&mut self) {
        self.pcm.clear();
        self.started_at = None;
    }
}
