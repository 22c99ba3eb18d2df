//! Per-session worker task
//!
//! Owns everything inside one session: endpoint detection, the utterance
//! buffer, the state machine, the active turn, and retained playback. All of
//! it is touched only from this task, so no locking is needed here. Inbound
//! frames are processed in arrival order; outbound chunks leave in
//! production order through a single channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::state::SessionState;
use super::turn::{CancelFlag, Playback, Turn, TurnStatus};
use super::{ControlCommand, Inbound, Outbound, SessionEvent};
use crate::config::Config;
use crate::error::Error;
use crate::pipeline::{PipelineEvent, TurnOutcome, TurnPipeline};
use crate::profile::{DeviceProfile, ProfileProvider};
use crate::prompt::HistoryTurn;
use crate::recorder::{RecordedOutcome, Recorder, RecorderEvent, TurnMetrics, TurnRecord};
use crate::segment::{
    AppendResult, Boundary, EndpointDetector, Utterance, UtteranceBuffer,
};

/// The turn (or retained-audio replay) currently producing events
struct ActiveTurn {
    turn: Turn,
    is_replay: bool,
}

/// Drives one device session until its channel closes
pub(super) struct SessionWorker {
    device_sn: String,
    session_id: Uuid,
    config: Config,
    pipeline: TurnPipeline,
    profiles: Arc<dyn ProfileProvider>,
    recorder: Recorder,
    outbound: mpsc::Sender<Outbound>,
    last_activity: Arc<AtomicI64>,

    state: SessionState,
    detector: EndpointDetector,
    buffer: UtteranceBuffer,
    history: Vec<HistoryTurn>,
    seq: u64,
    active: Option<ActiveTurn>,
    pipeline_rx: Option<mpsc::Receiver<PipelineEvent>>,
    playback: Option<Playback>,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        device_sn: String,
        session_id: Uuid,
        config: Config,
        pipeline: TurnPipeline,
        profiles: Arc<dyn ProfileProvider>,
        recorder: Recorder,
        outbound: mpsc::Sender<Outbound>,
        last_activity: Arc<AtomicI64>,
    ) -> Self {
        let detector = EndpointDetector::new(&config.audio, &config.segmenter);
        let buffer = UtteranceBuffer::new(&config.audio, &config.segmenter);
        Self {
            device_sn,
            session_id,
            config,
            pipeline,
            profiles,
            recorder,
            outbound,
            last_activity,
            state: SessionState::Idle,
            detector,
            buffer,
            history: Vec::new(),
            seq: 0,
            active: None,
            pipeline_rx: None,
            playback: None,
        }
    }

    /// Run until the inbound channel closes
    pub(super) async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        if self.state.transition(SessionState::Listening).is_err() {
            return;
        }
        if !self
            .emit(SessionEvent::Ready {
                device_sn: self.device_sn.clone(),
            })
            .await
        {
            return;
        }

        loop {
            let keep_going = if let Some(mut rx) = self.pipeline_rx.take() {
                tokio::select! {
                    frame = inbound.recv() => {
                        self.pipeline_rx = Some(rx);
                        match frame {
                            Some(frame) => self.handle_inbound(frame).await,
                            None => false,
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                self.pipeline_rx = Some(rx);
                                self.handle_pipeline_event(event).await
                            }
                            None => {
                                // Pipeline task died without a Finished event
                                self.active = None;
                                if matches!(
                                    self.state,
                                    SessionState::RunningTurn | SessionState::Speaking
                                ) {
                                    let _ = self.state.transition(SessionState::Listening);
                                }
                                true
                            }
                        }
                    }
                }
            } else {
                match inbound.recv().await {
                    Some(frame) => self.handle_inbound(frame).await,
                    None => false,
                }
            };

            if !keep_going {
                break;
            }
        }

        self.teardown();
    }

    // -- Inbound handling --

    async fn handle_inbound(&mut self, frame: Inbound) -> bool {
        self.touch();
        match frame {
            Inbound::Audio(bytes) => self.handle_audio(bytes).await,
            Inbound::Control(command) => self.handle_control(command).await,
        }
    }

    async fn handle_audio(&mut self, bytes: Vec<u8>) -> bool {
        let boundaries = self.detector.process(&bytes);
        let has_start = boundaries
            .iter()
            .any(|b| matches!(b, Boundary::SpeechStart { .. }));
        let has_end = boundaries
            .iter()
            .any(|b| matches!(b, Boundary::SpeechEnd { .. }));

        if has_start && !self.on_speech_start().await {
            return false;
        }

        if self.buffer.is_open() {
            match self.buffer.append(&bytes) {
                Ok(AppendResult::Buffered) => {}
                Ok(AppendResult::DurationExceeded) => {
                    // Force-finalize without waiting for a silence boundary
                    self.detector.reset();
                    return self.on_speech_end().await;
                }
                Err(e) => return self.on_buffer_overflow(&e).await,
            }
        }

        if has_end && !self.on_speech_end().await {
            return false;
        }

        true
    }

    async fn on_speech_start(&mut self) -> bool {
        match self.state {
            SessionState::Listening => {
                let _ = self.state.transition(SessionState::BufferingUtterance);
                self.buffer.begin();
                self.emit(SessionEvent::SpeechStart).await
            }
            SessionState::Speaking => {
                // Barge-in: flag the turn before anything else happens
                if !self.interrupt_active("barge_in").await {
                    return false;
                }
                let _ = self.state.transition(SessionState::Interrupted);
                self.buffer.begin();
                self.emit(SessionEvent::SpeechStart).await
            }
            SessionState::RunningTurn => {
                // Nothing audible yet; the new utterance simply replaces the
                // pending reply
                if !self.interrupt_active("barge_in").await {
                    return false;
                }
                let _ = self.state.transition(SessionState::BufferingUtterance);
                self.buffer.begin();
                self.emit(SessionEvent::SpeechStart).await
            }
            SessionState::Interrupted => {
                if !self.buffer.is_open() {
                    self.buffer.begin();
                    return self.emit(SessionEvent::SpeechStart).await;
                }
                true
            }
            SessionState::BufferingUtterance | SessionState::Idle => true,
        }
    }

    async fn on_speech_end(&mut self) -> bool {
        match self.state {
            SessionState::BufferingUtterance => {
                if !self.emit(SessionEvent::SpeechEnd).await {
                    return false;
                }
                match self.buffer.finalize() {
                    Some(utterance) => {
                        let _ = self.state.transition(SessionState::RunningTurn);
                        self.spawn_turn(utterance).await
                    }
                    None => {
                        let _ = self.state.transition(SessionState::Listening);
                        true
                    }
                }
            }
            SessionState::Interrupted => {
                if !self.emit(SessionEvent::SpeechEnd).await {
                    return false;
                }
                match self.buffer.finalize() {
                    Some(utterance) => {
                        // The interrupting speech becomes a fresh utterance,
                        // voiding the retained reply
                        let _ = self.state.transition(SessionState::BufferingUtterance);
                        let _ = self.state.transition(SessionState::RunningTurn);
                        self.spawn_turn(utterance).await
                    }
                    None => true,
                }
            }
            _ => true,
        }
    }

    async fn on_buffer_overflow(&mut self, error: &Error) -> bool {
        tracing::warn!(device_sn = %self.device_sn, error = %error, "utterance dropped");
        self.detector.reset();

        if self.state == SessionState::BufferingUtterance {
            let _ = self.state.transition(SessionState::Listening);
        }

        self.recorder.publish(RecorderEvent::PlaybackStatus {
            turn_id: Uuid::nil(),
            status: format!("utterance_dropped: {error}"),
        });
        self.emit(SessionEvent::Error {
            code: "capacity_exceeded".to_string(),
            message: error.to_string(),
        })
        .await
    }

    async fn handle_control(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Ping => self.emit(SessionEvent::Pong).await,
            ControlCommand::Stop => match self.state {
                SessionState::Speaking | SessionState::RunningTurn => {
                    if !self.interrupt_active("user_stop").await {
                        return false;
                    }
                    let _ = self.state.transition(SessionState::Interrupted);
                    true
                }
                _ => true,
            },
            ControlCommand::Resume => self.handle_resume().await,
        }
    }

    async fn handle_resume(&mut self) -> bool {
        if matches!(
            self.state,
            SessionState::Speaking | SessionState::RunningTurn
        ) {
            return self
                .emit(SessionEvent::ResumeRejected {
                    reason: "already_speaking".to_string(),
                })
                .await;
        }

        let retention = Duration::from_secs(self.config.session.playback_retention_secs);
        let resumable = self.state == SessionState::Interrupted
            && self
                .playback
                .as_ref()
                .is_some_and(|pb| pb.has_unsent() && !pb.is_expired(retention));

        if !resumable {
            if self
                .playback
                .as_ref()
                .is_some_and(|pb| pb.is_expired(retention))
            {
                tracing::debug!(device_sn = %self.device_sn, "retained playback expired");
                self.playback = None;
            }
            return self
                .emit(SessionEvent::ResumeRejected {
                    reason: "no_pending".to_string(),
                })
                .await;
        }

        // The device changed its mind mid-interruption; any partially
        // captured utterance is discarded
        self.buffer.abort();
        self.detector.reset();

        let Some(pb) = self.playback.as_mut() else {
            return self
                .emit(SessionEvent::ResumeRejected {
                    reason: "no_pending".to_string(),
                })
                .await;
        };
        pb.metrics.resume_count += 1;
        let (turn_id, seq, chunk_index, chunks) =
            (pb.turn_id, pb.seq, pb.sent_count(), pb.unsent_chunks());

        let _ = self.state.transition(SessionState::Speaking);
        if !self
            .emit(SessionEvent::ResumeStarted {
                turn_id,
                chunk_index,
            })
            .await
        {
            return false;
        }
        self.recorder.publish(RecorderEvent::PlaybackStatus {
            turn_id,
            status: "resumed".to_string(),
        });

        // Replay runs like a pipeline so barge-in handling stays uniform
        let turn = Turn {
            id: turn_id,
            seq,
            status: TurnStatus::Active,
            cancel: CancelFlag::new(),
            started_at: Utc::now(),
        };
        let cancel = turn.cancel.clone();
        let (tx, rx) = mpsc::channel(32);
        drop(tokio::spawn(async move {
            let mut cancelled = false;
            for chunk in chunks {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                if tx.send(PipelineEvent::AudioChunk(chunk)).await.is_err() {
                    return;
                }
            }
            let mut outcome = TurnOutcome::replay();
            outcome.status = if cancelled || cancel.is_cancelled() {
                TurnStatus::Cancelled
            } else {
                TurnStatus::Completed
            };
            let _ = tx.send(PipelineEvent::Finished(Box::new(outcome))).await;
        }));

        self.active = Some(ActiveTurn {
            turn,
            is_replay: true,
        });
        self.pipeline_rx = Some(rx);
        true
    }

    // -- Pipeline event handling --

    async fn handle_pipeline_event(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::Transcript(transcript) => {
                let Some(active) = &self.active else {
                    return true;
                };
                let turn_id = active.turn.id;
                let seq = active.turn.seq;
                if let Some(pb) = &mut self.playback {
                    pb.transcript.clone_from(&transcript);
                }
                self.emit(SessionEvent::TurnStarted {
                    turn_id,
                    seq,
                    transcript,
                })
                .await
            }
            PipelineEvent::TtsStarted => {
                let Some(active) = &self.active else {
                    return true;
                };
                let turn_id = active.turn.id;
                self.emit(SessionEvent::TtsStart { turn_id }).await
            }
            PipelineEvent::AudioChunk(chunk) => self.handle_audio_chunk(chunk).await,
            PipelineEvent::Finished(outcome) => self.on_turn_finished(*outcome).await,
        }
    }

    async fn handle_audio_chunk(&mut self, chunk: Vec<u8>) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        let turn_id = active.turn.id;
        let is_replay = active.is_replay;
        let gate_open = !active.turn.cancel.is_cancelled()
            && matches!(
                self.state,
                SessionState::RunningTurn | SessionState::Speaking
            );

        if !is_replay {
            if let Some(pb) = &mut self.playback {
                pb.push_chunk(chunk.clone());
            }
        }

        if !gate_open {
            // Cancelled turn: the chunk is retained, never sent
            return true;
        }

        if self.state == SessionState::RunningTurn {
            let _ = self.state.transition(SessionState::Speaking);
            self.recorder.publish(RecorderEvent::PlaybackStatus {
                turn_id,
                status: "speaking".to_string(),
            });
        }

        if self.outbound.send(Outbound::Audio(chunk)).await.is_err() {
            return false;
        }
        if let Some(pb) = &mut self.playback {
            pb.mark_sent();
        }
        true
    }

    async fn on_turn_finished(&mut self, outcome: TurnOutcome) -> bool {
        self.pipeline_rx = None;
        let Some(active) = self.active.take() else {
            return true;
        };
        let turn_id = active.turn.id;
        let seq = active.turn.seq;

        // A completion that raced an interruption is still an interruption:
        // the gate already held back chunks, so treat it as cancelled
        let status = if outcome.status == TurnStatus::Completed
            && (self.state == SessionState::Interrupted || active.turn.cancel.is_cancelled())
        {
            TurnStatus::Cancelled
        } else {
            outcome.status
        };

        match status {
            TurnStatus::Completed => {
                if active.is_replay {
                    return self.finish_replay(turn_id, seq).await;
                }

                self.history.push(HistoryTurn {
                    user_text: outcome.transcript.clone(),
                    reply_text: outcome.reply_text.clone(),
                });

                let mut metrics = outcome.metrics.clone();
                if let Some(pb) = &self.playback {
                    metrics.resume_count = pb.metrics.resume_count;
                }
                // Completed turns leave nothing to resume
                self.playback = None;

                if !self
                    .emit(SessionEvent::TurnEnd {
                        turn_id,
                        seq,
                        reply_text: outcome.reply_text.clone(),
                        metrics: metrics.clone(),
                    })
                    .await
                {
                    return false;
                }
                if !self.emit(SessionEvent::TtsEnd { turn_id }).await {
                    return false;
                }

                self.record_turn(turn_id, seq, &outcome, RecordedOutcome::Completed, metrics);
                let _ = self.state.transition(SessionState::Listening);
                true
            }
            TurnStatus::Cancelled => {
                if active.is_replay {
                    if let Some(pb) = &mut self.playback {
                        pb.mark_retained();
                        let chunks_sent = pb.sent_count();
                        let can_resume = pb.has_unsent();
                        self.recorder.publish(RecorderEvent::PlaybackStatus {
                            turn_id,
                            status: "interrupted".to_string(),
                        });
                        return self
                            .emit(SessionEvent::TtsPaused {
                                turn_id,
                                chunks_sent,
                                can_resume,
                            })
                            .await;
                    }
                    return true;
                }

                self.history.push(HistoryTurn {
                    user_text: outcome.transcript.clone(),
                    reply_text: outcome.reply_text.clone(),
                });

                let mut metrics = outcome.metrics.clone();
                let (chunks_sent, can_resume) = if let Some(pb) = &mut self.playback {
                    pb.reply_text.clone_from(&outcome.reply_text);
                    pb.transcript.clone_from(&outcome.transcript);
                    metrics.resume_count = pb.metrics.resume_count;
                    pb.metrics = metrics.clone();
                    pb.mark_retained();
                    (pb.sent_count(), pb.has_unsent())
                } else {
                    (0, false)
                };

                self.recorder.publish(RecorderEvent::PlaybackStatus {
                    turn_id,
                    status: "interrupted".to_string(),
                });
                self.record_turn(turn_id, seq, &outcome, RecordedOutcome::Cancelled, metrics);

                // Only an interruption awaiting disposition announces a
                // resumable pause; a turn replaced mid-run just ends
                if self.state == SessionState::Interrupted {
                    return self
                        .emit(SessionEvent::TtsPaused {
                            turn_id,
                            chunks_sent,
                            can_resume,
                        })
                        .await;
                }
                true
            }
            TurnStatus::Failed => {
                let message = outcome
                    .failure
                    .clone()
                    .unwrap_or_else(|| "turn failed".to_string());
                tracing::warn!(
                    device_sn = %self.device_sn,
                    turn_id = %turn_id,
                    error = %message,
                    "turn failed"
                );

                self.playback = None;
                self.record_turn(
                    turn_id,
                    seq,
                    &outcome,
                    RecordedOutcome::Failed,
                    outcome.metrics.clone(),
                );

                if !self
                    .emit(SessionEvent::Error {
                        code: "turn_failed".to_string(),
                        message,
                    })
                    .await
                {
                    return false;
                }

                // The channel stays open; fall back to listening
                if matches!(
                    self.state,
                    SessionState::RunningTurn | SessionState::Speaking
                ) {
                    let _ = self.state.transition(SessionState::Listening);
                }
                true
            }
            TurnStatus::Pending | TurnStatus::Active => true,
        }
    }

    async fn finish_replay(&mut self, turn_id: Uuid, seq: u64) -> bool {
        let Some(pb) = self.playback.take() else {
            let _ = self.state.transition(SessionState::Listening);
            return true;
        };

        self.history.push(HistoryTurn {
            user_text: pb.transcript.clone(),
            reply_text: pb.reply_text.clone(),
        });

        if !self
            .emit(SessionEvent::TurnEnd {
                turn_id,
                seq,
                reply_text: pb.reply_text.clone(),
                metrics: pb.metrics.clone(),
            })
            .await
        {
            return false;
        }
        if !self.emit(SessionEvent::TtsEnd { turn_id }).await {
            return false;
        }

        self.recorder.publish(RecorderEvent::Turn(TurnRecord {
            turn_id,
            device_sn: self.device_sn.clone(),
            seq,
            transcript: pb.transcript,
            reply_text: pb.reply_text,
            outcome: RecordedOutcome::Completed,
            risk_source: None,
            risk_reason: None,
            metrics: pb.metrics,
        }));

        let _ = self.state.transition(SessionState::Listening);
        true
    }

    // -- Turn lifecycle --

    async fn spawn_turn(&mut self, utterance: Utterance) -> bool {
        // At most one non-terminal turn: anything still active is cancelled
        // before the new turn exists
        if let Some(old) = self.active.take() {
            old.turn.cancel.cancel();
            self.pipeline_rx = None;
            self.record_superseded(&old);
        }
        self.playback = None;

        self.seq += 1;
        let turn = Turn::new(self.seq);
        tracing::info!(
            device_sn = %self.device_sn,
            turn_id = %turn.id,
            seq = turn.seq,
            bytes = utterance.byte_len(),
            "turn spawned"
        );

        let profile = match self.profiles.profile(&self.device_sn).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "profile lookup failed, using fallback");
                DeviceProfile::fallback(&self.device_sn)
            }
        };

        let (tx, rx) = mpsc::channel(32);
        let pipeline = self.pipeline.clone();
        let cancel = turn.cancel.clone();
        let history = self.history.clone();
        drop(tokio::spawn(async move {
            pipeline.run(utterance, profile, history, cancel, tx).await;
        }));

        self.playback = Some(Playback::new(turn.id, turn.seq, String::new()));
        self.active = Some(ActiveTurn {
            turn,
            is_replay: false,
        });
        self.pipeline_rx = Some(rx);
        true
    }

    /// Flag the active turn cancelled and tell the device
    async fn interrupt_active(&mut self, reason: &str) -> bool {
        let turn_id = self.active.as_ref().map(|active| {
            active.turn.cancel.cancel();
            active.turn.id
        });
        if let Some(pb) = &mut self.playback {
            pb.mark_retained();
        }

        tracing::info!(
            device_sn = %self.device_sn,
            reason = reason,
            turn_id = ?turn_id,
            "interrupting playback"
        );
        self.emit(SessionEvent::InterruptRequested {
            reason: reason.to_string(),
            turn_id,
        })
        .await
    }

    /// Record a turn that was replaced before its Finished event arrived
    fn record_superseded(&self, old: &ActiveTurn) {
        if old.is_replay {
            return;
        }
        let (transcript, reply_text, metrics) = self.playback.as_ref().map_or_else(
            || (String::new(), String::new(), TurnMetrics::default()),
            |pb| (pb.transcript.clone(), pb.reply_text.clone(), pb.metrics.clone()),
        );
        self.recorder.publish(RecorderEvent::Turn(TurnRecord {
            turn_id: old.turn.id,
            device_sn: self.device_sn.clone(),
            seq: old.turn.seq,
            transcript,
            reply_text,
            outcome: RecordedOutcome::Cancelled,
            risk_source: None,
            risk_reason: None,
            metrics,
        }));
    }

    fn record_turn(
        &self,
        turn_id: Uuid,
        seq: u64,
        outcome: &TurnOutcome,
        recorded: RecordedOutcome,
        metrics: TurnMetrics,
    ) {
        self.recorder.publish(RecorderEvent::Turn(TurnRecord {
            turn_id,
            device_sn: self.device_sn.clone(),
            seq,
            transcript: outcome.transcript.clone(),
            reply_text: outcome.reply_text.clone(),
            outcome: recorded,
            risk_source: outcome.risk_source.map(|s| s.to_string()),
            risk_reason: outcome.risk_reason.clone(),
            metrics,
        }));
    }

    // -- Lifecycle helpers --

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    async fn emit(&self, event: SessionEvent) -> bool {
        self.outbound.send(Outbound::Event(event)).await.is_ok()
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            active.turn.cancel.cancel();
            self.record_superseded(&active);
        }
        self.pipeline_rx = None;
        self.playback = None;

        let _ = self.state.transition(SessionState::Idle);
        tracing::info!(
            device_sn = %self.device_sn,
            session_id = %self.session_id,
            "session worker stopped"
        );
        self.recorder.publish(RecorderEvent::SessionClosed {
            device_sn: self.device_sn.clone(),
            session_id: self.session_id,
            at: Utc::now(),
        });
    }
}
