//! No-op capability providers
//!
//! Used when no credentials are configured and throughout the test suite.
//! Deterministic: fixed transcript, canned reply fragments, and a pure tone
//! for audio.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;

use super::{AsrProvider, AudioStream, LlmProvider, TextStream, TtsProvider};
use crate::prompt::ChatMessage;
use crate::Result;

/// Tone parameters for dummy audio
const TONE_SAMPLE_RATE: u32 = 16_000;
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 8_000.0;

/// Dummy ASR returning a fixed transcript
pub struct DummyAsr {
    transcript: String,
    calls: AtomicUsize,
}

impl Default for DummyAsr {
    fn default() -> Self {
        Self::new("Hello buddy!")
    }
}

impl DummyAsr {
    /// Create with the transcript every utterance will produce
    #[must_use]
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of transcribe calls made so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsrProvider for DummyAsr {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn transcribe(&self, pcm: &[u8], _sample_rate: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(bytes = pcm.len(), "dummy transcription");
        Ok(self.transcript.clone())
    }
}

/// Dummy LLM streaming a canned reply in a few fragments
pub struct DummyLlm {
    fragments: Vec<String>,
    calls: AtomicUsize,
}

impl Default for DummyLlm {
    fn default() -> Self {
        Self::new(&[
            "That sounds ",
            "really fun! ",
            "Want to hear ",
            "a little story about it?",
        ])
    }
}

impl DummyLlm {
    /// Create with the fragments every prompt will produce
    #[must_use]
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(ToString::to_string).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of generate calls made so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for DummyLlm {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> Result<TextStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fragments = self.fragments.clone();
        Ok(futures::stream::iter(fragments.into_iter().map(Ok)).boxed())
    }
}

/// Dummy TTS producing 100ms chunks of a fixed tone
pub struct DummyTts {
    calls: AtomicUsize,
}

impl Default for DummyTts {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl DummyTts {
    /// Number of synthesize calls made so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// One 100ms chunk of the tone, offset so chunks join continuously
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn tone_chunk(chunk_index: usize) -> Vec<u8> {
        let samples_per_chunk = TONE_SAMPLE_RATE as usize / 10;
        let base = chunk_index * samples_per_chunk;
        let samples: Vec<i16> = (0..samples_per_chunk)
            .map(|i| {
                let t = (base + i) as f32 / TONE_SAMPLE_RATE as f32;
                ((2.0 * std::f32::consts::PI * TONE_HZ * t).sin() * TONE_AMPLITUDE) as i16
            })
            .collect();
        crate::audio::samples_to_pcm(&samples)
    }
}

#[async_trait]
impl TtsProvider for DummyTts {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Roughly one chunk per 8 characters keeps durations text-proportional
        let chunks = (text.chars().count() / 8).clamp(1, 20);
        Ok(
            futures::stream::iter((0..chunks).map(|i| Ok(Self::tone_chunk(i))))
                .boxed(),
        )
    }
}
