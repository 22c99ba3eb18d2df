//! Error types for the Buddy gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage that a provider error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Speech recognition
    Asr,
    /// Reply generation
    Llm,
    /// Speech synthesis
    Tts,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Asr => write!(f, "asr"),
            Self::Llm => write!(f, "llm"),
            Self::Tts => write!(f, "tts"),
        }
    }
}

/// Errors that can occur in the Buddy gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Utterance buffer overflow
    #[error("utterance capacity exceeded: {0} bytes")]
    Capacity(usize),

    /// A provider call exceeded its deadline
    #[error("{stage} provider timed out after {timeout_ms}ms")]
    ProviderTimeout {
        /// Stage whose deadline expired
        stage: Stage,
        /// Configured deadline
        timeout_ms: u64,
    },

    /// A provider returned an error or unusable result
    #[error("{stage} provider failed: {message}")]
    Provider {
        /// Stage that failed
        stage: Stage,
        /// Provider-reported reason
        message: String,
    },

    /// The device channel closed mid-operation
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Operation conflicts with current session state
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Session not found for device
    #[error("no session for device: {0}")]
    SessionNotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding error
    #[error("audio error: {0}")]
    Audio(String),
}

impl Error {
    /// Shorthand for a provider failure at the given stage
    #[must_use]
    pub fn provider(stage: Stage, message: impl Into<String>) -> Self {
        Self::Provider {
            stage,
            message: message.into(),
        }
    }
}
