//! Session management
//!
//! One session per connected device: a registry maps device serials to live
//! sessions, each driven by its own worker task. The registry mutex guards
//! only insert/remove/lookup — never a provider call.

mod state;
mod turn;
mod worker;

pub use state::SessionState;
pub use turn::{CancelFlag, Playback, Turn, TurnStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::TurnPipeline;
use crate::profile::ProfileProvider;
use crate::providers::ProviderSet;
use crate::recorder::{Recorder, RecorderEvent, TurnMetrics};
use crate::{Error, Result};

/// Control commands a device can send alongside audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness probe
    Ping,
    /// Stop the current reply playback
    Stop,
    /// Resume the interrupted reply from where it stopped
    Resume,
}

/// Inbound traffic routed to a session worker
#[derive(Debug)]
pub enum Inbound {
    /// Raw PCM from the device
    Audio(Vec<u8>),
    /// Parsed control command
    Control(ControlCommand),
}

/// JSON events sent back to the device
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session established
    Ready {
        /// Device serial the session is bound to
        device_sn: String,
    },
    /// Reply to a ping
    Pong,
    /// The segmenter confirmed speech began
    SpeechStart,
    /// The segmenter confirmed the utterance ended
    SpeechEnd,
    /// Reply playback is being interrupted
    InterruptRequested {
        /// "barge_in" or "user_stop"
        reason: String,
        /// Turn being interrupted, when one is active
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<Uuid>,
    },
    /// A turn started; transcription is available
    TurnStarted {
        /// Turn identifier
        turn_id: Uuid,
        /// Position within the session
        seq: u64,
        /// What the device said
        transcript: String,
    },
    /// Synthesis began; audio frames follow
    TtsStart {
        /// Turn identifier
        turn_id: Uuid,
    },
    /// Playback paused with audio retained for resume
    TtsPaused {
        /// Turn identifier
        turn_id: Uuid,
        /// Chunks already sent before the pause
        chunks_sent: usize,
        /// Whether an explicit resume can continue this turn
        can_resume: bool,
    },
    /// Playback resumed from retained audio
    ResumeStarted {
        /// Turn identifier
        turn_id: Uuid,
        /// Index of the first chunk being replayed
        chunk_index: usize,
    },
    /// A resume request was declined
    ResumeRejected {
        /// "no_pending" or "already_speaking"
        reason: String,
    },
    /// The turn finished; all audio has been sent
    TurnEnd {
        /// Turn identifier
        turn_id: Uuid,
        /// Position within the session
        seq: u64,
        /// Full reply text
        reply_text: String,
        /// Timing and playback metrics
        metrics: TurnMetrics,
    },
    /// No more audio frames for this turn
    TtsEnd {
        /// Turn identifier
        turn_id: Uuid,
    },
    /// Something went wrong; the channel stays open
    Error {
        /// Stable error code
        code: String,
        /// Human-readable detail
        message: String,
    },
}

/// Outbound traffic produced by a session worker
#[derive(Debug)]
pub enum Outbound {
    /// JSON event frame
    Event(SessionEvent),
    /// Binary PCM frame
    Audio(Vec<u8>),
}

/// Registry entry for one live session
struct SessionHandle {
    session_id: Uuid,
    inbound_tx: mpsc::Sender<Inbound>,
    last_activity: Arc<AtomicI64>,
}

/// Owns the set of active sessions keyed by device serial
pub struct SessionManager {
    config: Config,
    pipeline: TurnPipeline,
    profiles: Arc<dyn ProfileProvider>,
    recorder: Recorder,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    /// Create a manager with the given collaborators
    #[must_use]
    pub fn new(
        config: Config,
        providers: ProviderSet,
        profiles: Arc<dyn ProfileProvider>,
        recorder: Recorder,
    ) -> Self {
        let pipeline = TurnPipeline::new(providers, config.pipeline.clone(), &config.audio);
        Self {
            config,
            pipeline,
            profiles,
            recorder,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a session for a device
    ///
    /// Returns the receiver for the session's outbound traffic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateConflict`] when the device already has a live
    /// session — one channel per device at a time; the first stays active.
    pub async fn open(&self, device_sn: &str) -> Result<mpsc::Receiver<Outbound>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(device_sn) {
            return Err(Error::StateConflict(format!(
                "device already connected: {device_sn}"
            )));
        }

        let session_id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.session.frame_queue_depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let last_activity = Arc::new(AtomicI64::new(Utc::now().timestamp()));

        let worker = worker::SessionWorker::new(
            device_sn.to_string(),
            session_id,
            self.config.clone(),
            self.pipeline.clone(),
            Arc::clone(&self.profiles),
            self.recorder.clone(),
            outbound_tx,
            Arc::clone(&last_activity),
        );
        drop(tokio::spawn(worker.run(inbound_rx)));

        sessions.insert(
            device_sn.to_string(),
            SessionHandle {
                session_id,
                inbound_tx,
                last_activity,
            },
        );

        tracing::info!(device_sn = %device_sn, session_id = %session_id, "session opened");
        self.recorder.publish(RecorderEvent::SessionOpened {
            device_sn: device_sn.to_string(),
            session_id,
            at: Utc::now(),
        });

        Ok(outbound_rx)
    }

    /// Route an inbound PCM frame to the device's session
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] for unknown devices and
    /// [`Error::ChannelClosed`] when the session worker has gone away.
    pub async fn route_frame(&self, device_sn: &str, frame: Vec<u8>) -> Result<()> {
        let tx = self.sender_for(device_sn).await?;
        tx.send(Inbound::Audio(frame))
            .await
            .map_err(|_| Error::ChannelClosed(device_sn.to_string()))
    }

    /// Route a control command to the device's session
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::route_frame`].
    pub async fn control(&self, device_sn: &str, command: ControlCommand) -> Result<()> {
        let tx = self.sender_for(device_sn).await?;
        tx.send(Inbound::Control(command))
            .await
            .map_err(|_| Error::ChannelClosed(device_sn.to_string()))
    }

    /// Tear down a device's session
    ///
    /// Dropping the inbound sender lets the worker cancel any active turn,
    /// emit its final records, and exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotFound`] when the device has no session.
    pub async fn close(&self, device_sn: &str) -> Result<()> {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .remove(device_sn)
                .ok_or_else(|| Error::SessionNotFound(device_sn.to_string()))?
        };

        tracing::info!(
            device_sn = %device_sn,
            session_id = %handle.session_id,
            "session closed"
        );
        Ok(())
    }

    /// Number of live sessions
    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Spawn the periodic sweep that closes idle sessions
    pub fn spawn_idle_sweeper(manager: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            interval.tick().await;

            loop {
                interval.tick().await;
                let idle_cutoff =
                    Utc::now().timestamp() - manager.config.session.idle_timeout_secs as i64;

                let stale: Vec<String> = {
                    let sessions = manager.sessions.lock().await;
                    sessions
                        .iter()
                        .filter(|(_, h)| h.last_activity.load(Ordering::SeqCst) < idle_cutoff)
                        .map(|(sn, _)| sn.clone())
                        .collect()
                };

                for device_sn in stale {
                    tracing::info!(device_sn = %device_sn, "closing idle session");
                    let _ = manager.close(&device_sn).await;
                }
            }
        })
    }

    async fn sender_for(&self, device_sn: &str) -> Result<mpsc::Sender<Inbound>> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(device_sn)
            .ok_or_else(|| Error::SessionNotFound(device_sn.to_string()))?;
        handle
            .last_activity
            .store(Utc::now().timestamp(), Ordering::SeqCst);
        Ok(handle.inbound_tx.clone())
    }
}
