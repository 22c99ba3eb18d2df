//! Turn recorder events
//!
//! The gateway durably records nothing itself; it emits session and turn
//! records to an external recorder service. Publishing is best-effort —
//! failures are logged and never propagate to the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Timing and playback metrics attached to a turn record
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnMetrics {
    /// Milliseconds from utterance finalization to complete reply text
    pub gen_ms: u64,

    /// Milliseconds from synthesis start to the first audio chunk, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfa_ms: Option<u64>,

    /// Text segments handed to synthesis
    pub seg_count: usize,

    /// PCM chunks produced
    pub chunk_count: usize,

    /// Times playback was explicitly resumed
    pub resume_count: u32,
}

/// Final disposition recorded for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedOutcome {
    /// All reply audio was sent
    Completed,
    /// The turn was cancelled by barge-in, stop, or teardown
    Cancelled,
    /// A pipeline stage failed or timed out
    Failed,
}

/// One turn's durable record
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    /// Turn identifier
    pub turn_id: Uuid,
    /// Device this turn belongs to
    pub device_sn: String,
    /// Position within the session
    pub seq: u64,
    /// What the child said
    pub transcript: String,
    /// What the toy replied
    pub reply_text: String,
    /// Final disposition
    pub outcome: RecordedOutcome,
    /// Which side tripped the safety gate, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_source: Option<String>,
    /// Matched keyword or failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_reason: Option<String>,
    /// Timing and playback metrics
    pub metrics: TurnMetrics,
}

/// Event published to the recorder
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecorderEvent {
    /// A device channel opened
    SessionOpened {
        /// Device serial
        device_sn: String,
        /// Session identifier
        session_id: Uuid,
        /// When the channel opened
        at: DateTime<Utc>,
    },
    /// A device channel closed
    SessionClosed {
        /// Device serial
        device_sn: String,
        /// Session identifier
        session_id: Uuid,
        /// When the channel closed
        at: DateTime<Utc>,
    },
    /// A turn reached a terminal status
    Turn(TurnRecord),
    /// Playback status changed mid-turn
    PlaybackStatus {
        /// Turn whose playback changed
        turn_id: Uuid,
        /// "speaking", "interrupted", or "resumed"
        status: String,
    },
}

/// Where published events go
enum Sink {
    /// POST each event as JSON
    Http { client: reqwest::Client, url: String },
    /// Deliver in-process (tests)
    Channel(mpsc::UnboundedSender<RecorderEvent>),
    /// Log and drop
    Null,
}

/// Handle for publishing recorder events
///
/// Cheap to clone; every publish is fire-and-forget.
#[derive(Clone)]
pub struct Recorder {
    sink: std::sync::Arc<Sink>,
}

impl Recorder {
    /// Recorder that POSTs events to the given URL
    #[must_use]
    pub fn http(url: String) -> Self {
        Self {
            sink: std::sync::Arc::new(Sink::Http {
                client: reqwest::Client::new(),
                url,
            }),
        }
    }

    /// Recorder that drops events after logging them
    #[must_use]
    pub fn noop() -> Self {
        Self {
            sink: std::sync::Arc::new(Sink::Null),
        }
    }

    /// Recorder delivering events to an in-process receiver
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RecorderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sink: std::sync::Arc::new(Sink::Channel(tx)),
            },
            rx,
        )
    }

    /// Recorder selected from configuration
    #[must_use]
    pub fn from_config(recorder_url: Option<&str>) -> Self {
        recorder_url.map_or_else(Self::noop, |url| Self::http(url.to_string()))
    }

    /// Publish an event, best-effort
    ///
    /// Never blocks the caller on delivery and never returns an error.
    pub fn publish(&self, event: RecorderEvent) {
        match self.sink.as_ref() {
            Sink::Http { client, url } => {
                let client = client.clone();
                let url = url.clone();
                drop(tokio::spawn(async move {
                    let result = client.post(&url).json(&event).send().await;
                    match result {
                        Ok(response) if !response.status().is_success() => {
                            tracing::warn!(
                                status = %response.status(),
                                "recorder rejected event"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to publish recorder event");
                        }
                        Ok(_) => {}
                    }
                }));
            }
            Sink::Channel(tx) => {
                if tx.send(event).is_err() {
                    tracing::warn!("recorder channel receiver dropped");
                }
            }
            Sink::Null => {
                tracing::debug!(?event, "recorder event dropped (no sink configured)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: RecordedOutcome) -> TurnRecord {
        TurnRecord {
            turn_id: Uuid::new_v4(),
            device_sn: "toy-001".to_string(),
            seq: 1,
            transcript: "hello".to_string(),
            reply_text: "hi there!".to_string(),
            outcome,
            risk_source: None,
            risk_reason: None,
            metrics: TurnMetrics::default(),
        }
    }

    #[test]
    fn turn_event_serializes_with_tag() {
        let json =
            serde_json::to_string(&RecorderEvent::Turn(record(RecordedOutcome::Completed)))
                .unwrap();
        assert!(json.contains("\"type\":\"turn\""));
        assert!(json.contains("\"outcome\":\"completed\""));
        // Absent risk fields are omitted entirely
        assert!(!json.contains("risk_source"));
    }

    #[test]
    fn risk_fields_serialize_when_present() {
        let mut turn = record(RecordedOutcome::Completed);
        turn.risk_source = Some("input".to_string());
        turn.risk_reason = Some("weapon".to_string());

        let json = serde_json::to_string(&RecorderEvent::Turn(turn)).unwrap();
        assert!(json.contains("\"risk_source\":\"input\""));
    }

    #[tokio::test]
    async fn channel_recorder_delivers_events() {
        let (recorder, mut rx) = Recorder::channel();
        recorder.publish(RecorderEvent::PlaybackStatus {
            turn_id: Uuid::new_v4(),
            status: "speaking".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RecorderEvent::PlaybackStatus { .. }));
    }

    #[test]
    fn noop_recorder_never_panics() {
        let recorder = Recorder::noop();
        recorder.publish(RecorderEvent::Turn(record(RecordedOutcome::Failed)));
    }
}
