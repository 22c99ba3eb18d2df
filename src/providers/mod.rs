//! Capability providers: ASR, LLM, TTS
//!
//! Each capability is a narrow async trait with an HTTP-backed implementation
//! and a dummy fallback. Which variant runs is decided once, at construction
//! time, from configuration.

mod asr;
mod dummy;
mod llm;
mod tts;

pub use asr::HttpAsr;
pub use dummy::{DummyAsr, DummyLlm, DummyTts};
pub use llm::HttpLlm;
pub use tts::HttpTts;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ProvidersConfig;
use crate::prompt::ChatMessage;
use crate::Result;

/// Stream of reply-text fragments from the LLM
pub type TextStream = BoxStream<'static, Result<String>>;

/// Stream of PCM chunks from TTS
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Speech recognition
#[async_trait]
pub trait AsrProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Transcribe an utterance of raw PCM (16-bit mono little-endian)
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails.
    async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<String>;
}

/// Reply generation
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Generate a reply as a stream of text fragments
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started; per-fragment errors
    /// surface through the stream.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<TextStream>;
}

/// Speech synthesis
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Synthesize one text segment as a stream of PCM chunks
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started; per-chunk errors
    /// surface through the stream.
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// The provider triple one gateway instance runs with
#[derive(Clone)]
pub struct ProviderSet {
    /// Speech recognition
    pub asr: Arc<dyn AsrProvider>,
    /// Reply generation
    pub llm: Arc<dyn LlmProvider>,
    /// Speech synthesis
    pub tts: Arc<dyn TtsProvider>,
}

impl ProviderSet {
    /// Build providers from configuration
    ///
    /// Falls back to the dummy variant for every capability whose
    /// credentials are absent, so the gateway always starts.
    #[must_use]
    pub fn from_config(cfg: &ProvidersConfig) -> Self {
        let set = cfg.openai_api_key.as_ref().map_or_else(
            || Self {
                asr: Arc::new(DummyAsr::default()),
                llm: Arc::new(DummyLlm::default()),
                tts: Arc::new(DummyTts::default()),
            },
            |key| Self {
                asr: Arc::new(HttpAsr::new(key.clone(), cfg.asr_model.clone())),
                llm: Arc::new(HttpLlm::new(
                    key.clone(),
                    cfg.llm_base_url.clone(),
                    cfg.llm_model.clone(),
                    cfg.llm_temperature,
                    cfg.llm_max_tokens,
                )),
                tts: Arc::new(HttpTts::new(
                    key.clone(),
                    cfg.tts_model.clone(),
                    cfg.tts_voice.clone(),
                    cfg.tts_speed,
                )),
            },
        );

        tracing::info!(
            asr = set.asr.name(),
            llm = set.llm.name(),
            tts = set.tts.name(),
            "providers initialized"
        );
        set
    }

    /// A fully dummy set, handy for tests and offline runs
    #[must_use]
    pub fn dummy() -> Self {
        Self {
            asr: Arc::new(DummyAsr::default()),
            llm: Arc::new(DummyLlm::default()),
            tts: Arc::new(DummyTts::default()),
        }
    }
}
