//! Configuration management for the Buddy gateway

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Buddy gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound audio format
    pub audio: AudioConfig,

    /// Endpoint detection tuning
    pub segmenter: SegmenterConfig,

    /// Turn pipeline tuning
    pub pipeline: PipelineConfig,

    /// Session lifecycle tuning
    pub session: SessionConfig,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Capability provider configuration
    pub providers: ProvidersConfig,

    /// Turn recorder sink URL (events are dropped when unset)
    pub recorder_url: Option<String>,
}

/// Inbound audio format; devices stream 16-bit mono little-endian PCM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Frame duration the segmenter classifies at, in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Bytes in one segmenter frame (16-bit mono)
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * 2
    }

    /// Bytes per second of audio
    #[must_use]
    pub const fn bytes_per_sec(&self) -> usize {
        self.sample_rate as usize * 2
    }
}

/// Endpoint detection tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// RMS energy threshold above which a frame counts as speech
    pub rms_threshold: f64,

    /// Consecutive speech frames required to emit a start boundary
    pub speech_start_frames: u32,

    /// Consecutive silence frames required to emit an end boundary
    pub speech_end_silence_frames: u32,

    /// Force-finalize an utterance after this many milliseconds
    pub max_utterance_ms: u64,

    /// Hard cap on buffered utterance bytes
    pub max_buffer_bytes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            rms_threshold: 500.0,
            speech_start_frames: 3,             // 60ms of speech to open
            speech_end_silence_frames: 12,      // 240ms of silence to close
            max_utterance_ms: 15_000,
            max_buffer_bytes: 1024 * 1024,      // ~32s at 16kHz s16le
        }
    }
}

/// Turn pipeline tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// ASR call deadline in milliseconds
    pub asr_timeout_ms: u64,

    /// LLM deadline in milliseconds, covering the whole fragment stream
    pub llm_timeout_ms: u64,

    /// TTS deadline in milliseconds, per synthesized segment
    pub tts_timeout_ms: u64,

    /// Recent turns included in the LLM prompt
    pub max_history_turns: usize,

    /// Transcript substituted when ASR hears nothing usable
    pub empty_transcript_placeholder: String,

    /// Longest text segment handed to TTS, in characters
    pub segment_max_chars: usize,

    /// Segments shorter than this are merged into their predecessor
    pub segment_min_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            asr_timeout_ms: 10_000,
            llm_timeout_ms: 30_000,
            tts_timeout_ms: 10_000,
            max_history_turns: 6,
            empty_transcript_placeholder: "(no speech recognized)".to_string(),
            segment_max_chars: 80,
            segment_min_chars: 10,
        }
    }
}

/// Session lifecycle tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close sessions idle for this many seconds
    pub idle_timeout_secs: u64,

    /// How long a cancelled turn's unsent audio stays resumable
    pub playback_retention_secs: u64,

    /// Inbound frame queue depth per session
    pub frame_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            playback_retention_secs: 60,
            frame_queue_depth: 256,
        }
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,
}

/// Capability provider configuration
///
/// Each capability falls back to its dummy variant when the corresponding
/// credentials are absent, so the gateway always starts.
#[derive(Debug, Clone, Default)]
pub struct ProvidersConfig {
    /// `OpenAI`-compatible API key (ASR, LLM, TTS)
    pub openai_api_key: Option<String>,

    /// Base URL for the LLM chat completions API
    pub llm_base_url: String,

    /// ASR model identifier (e.g. "whisper-1")
    pub asr_model: String,

    /// LLM model identifier
    pub llm_model: String,

    /// LLM sampling temperature
    pub llm_temperature: f64,

    /// LLM reply token budget
    pub llm_max_tokens: u32,

    /// TTS model identifier (e.g. "tts-1")
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier
    pub tts_speed: f64,
}

/// Tunables that may be overridden from a TOML file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Tunables {
    audio: Option<AudioConfig>,
    segmenter: Option<SegmenterConfig>,
    pipeline: Option<PipelineConfig>,
    session: Option<SessionConfig>,
}

impl Config {
    /// Load configuration from the environment, with optional TOML overrides
    ///
    /// Reads `BUDDY_CONFIG_FILE` (or `./buddy.toml` if present) for tunables;
    /// credentials and endpoints come from environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if an explicitly named config file cannot be parsed.
    pub fn load() -> Result<Self> {
        let tunables = Self::load_tunables()?;

        let providers = ProvidersConfig {
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            llm_base_url: std::env::var("BUDDY_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            asr_model: std::env::var("BUDDY_ASR_MODEL")
                .unwrap_or_else(|_| "whisper-1".to_string()),
            llm_model: std::env::var("BUDDY_LLM_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_temperature: std::env::var("BUDDY_LLM_TEMPERATURE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.8),
            llm_max_tokens: std::env::var("BUDDY_LLM_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            tts_model: std::env::var("BUDDY_TTS_MODEL")
                .unwrap_or_else(|_| "tts-1".to_string()),
            tts_voice: std::env::var("BUDDY_TTS_VOICE")
                .unwrap_or_else(|_| "alloy".to_string()),
            tts_speed: std::env::var("BUDDY_TTS_SPEED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
        };

        let api_server = ApiServerConfig {
            port: std::env::var("BUDDY_API_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(18890),
        };

        Ok(Self {
            audio: tunables.audio.unwrap_or_default(),
            segmenter: tunables.segmenter.unwrap_or_default(),
            pipeline: tunables.pipeline.unwrap_or_default(),
            session: tunables.session.unwrap_or_default(),
            api_server,
            providers,
            recorder_url: std::env::var("BUDDY_RECORDER_URL").ok(),
        })
    }

    /// Load tunables from a TOML file, if one is configured or present
    fn load_tunables() -> Result<Tunables> {
        if let Ok(path) = std::env::var("BUDDY_CONFIG_FILE") {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read {path}: {e}")))?;
            let tunables = toml::from_str(&content)?;
            tracing::info!(path = %path, "loaded config file");
            return Ok(tunables);
        }

        let default_path = Path::new("buddy.toml");
        if default_path.exists() {
            match std::fs::read_to_string(default_path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(tunables) => {
                        tracing::info!(path = %default_path.display(), "loaded config file");
                        return Ok(tunables);
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %default_path.display(),
                            error = %e,
                            "failed to parse config file, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %default_path.display(),
                        error = %e,
                        "failed to read config file"
                    );
                }
            }
        }

        Ok(Tunables::default())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            segmenter: SegmenterConfig::default(),
            pipeline: PipelineConfig::default(),
            session: SessionConfig::default(),
            api_server: ApiServerConfig { port: 18890 },
            providers: ProvidersConfig::default(),
            recorder_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_matches_format() {
        let audio = AudioConfig::default();
        // 20ms at 16kHz mono s16le
        assert_eq!(audio.frame_bytes(), 640);
        assert_eq!(audio.bytes_per_sec(), 32_000);
    }

    #[test]
    fn tunables_parse_partial_file() {
        let tunables: Tunables = toml::from_str(
            r#"
            [segmenter]
            rms_threshold = 800.0
            max_utterance_ms = 10000
            "#,
        )
        .unwrap();

        let seg = tunables.segmenter.unwrap();
        assert!((seg.rms_threshold - 800.0).abs() < f64::EPSILON);
        assert_eq!(seg.max_utterance_ms, 10_000);
        // Unspecified fields keep their defaults
        assert_eq!(seg.speech_start_frames, 3);
        assert!(tunables.pipeline.is_none());
    }
}
