//! Buddy Gateway - Real-time voice companion backend for smart toys
//!
//! This library provides the core functionality for the Buddy gateway:
//! - Utterance endpoint detection over streamed PCM
//! - Per-session turn pipeline (ASR → LLM → TTS) with barge-in
//! - Explicit resume of interrupted replies
//! - Pluggable capability providers with dummy fallbacks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Devices                          │
//! │        PCM in / PCM + events out (WebSocket)         │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Buddy Gateway                        │
//! │  Segmenter │ Sessions │ Turn Pipeline │ Recorder    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Capability Providers                    │
//! │          ASR    │    LLM    │    TTS                │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod profile;
pub mod prompt;
pub mod providers;
pub mod recorder;
pub mod safety;
pub mod segment;
pub mod session;

pub use config::Config;
pub use error::{Error, Result, Stage};
pub use profile::{DeviceProfile, ProfileProvider, StaticProfiles};
pub use providers::ProviderSet;
pub use recorder::{Recorder, RecorderEvent};
pub use session::{SessionManager, SessionState};
