//! Turn pipeline: ASR → LLM → TTS
//!
//! Drives one finalized utterance through transcription, reply generation,
//! and synthesis. Stages overlap: synthesis starts on the first complete
//! sentence while the LLM is still streaming. Cancellation is cooperative —
//! the shared flag is checked before every provider call and between chunks;
//! an in-flight call completes and its output is discarded. Every provider
//! call runs under a bounded deadline so a hung backend fails the turn
//! instead of wedging the session.

pub mod chunker;

use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::{AudioConfig, PipelineConfig};
use crate::error::Stage;
use crate::profile::DeviceProfile;
use crate::prompt::{self, HistoryTurn};
use crate::providers::ProviderSet;
use crate::recorder::TurnMetrics;
use crate::safety::{self, RiskSource};
use crate::segment::Utterance;
use crate::session::{CancelFlag, TurnStatus};
use crate::{Error, Result};

/// Events emitted to the session worker while a turn runs
#[derive(Debug)]
pub enum PipelineEvent {
    /// ASR finished; the turn is now visible to the device
    Transcript(String),
    /// First synthesis call is about to produce audio
    TtsStarted,
    /// One PCM chunk, in production order
    AudioChunk(Vec<u8>),
    /// The pipeline finished; always the last event
    Finished(Box<TurnOutcome>),
}

/// Terminal result of one pipeline run
#[derive(Debug)]
pub struct TurnOutcome {
    /// Completed, Cancelled, or Failed
    pub status: TurnStatus,
    /// Transcript of the utterance (placeholder when ASR heard nothing)
    pub transcript: String,
    /// Reply text that was (or would have been) spoken
    pub reply_text: String,
    /// Which side tripped the safety gate, if any
    pub risk_source: Option<RiskSource>,
    /// Matched keyword when the safety gate tripped
    pub risk_reason: Option<String>,
    /// Timing and throughput metrics
    pub metrics: TurnMetrics,
    /// Failure detail when status is Failed
    pub failure: Option<String>,
}

impl TurnOutcome {
    fn new() -> Self {
        Self {
            status: TurnStatus::Active,
            transcript: String::new(),
            reply_text: String::new(),
            risk_source: None,
            risk_reason: None,
            metrics: TurnMetrics::default(),
            failure: None,
        }
    }

    /// Blank outcome for retained-audio replay, which runs no stages
    #[must_use]
    pub fn replay() -> Self {
        Self::new()
    }

    fn cancelled(mut self) -> Self {
        self.status = TurnStatus::Cancelled;
        self
    }

    fn failed(mut self, error: &Error) -> Self {
        self.status = TurnStatus::Failed;
        self.failure = Some(error.to_string());
        self
    }
}

/// What the reply producer half of the pipeline returned
struct ProducerResult {
    reply_text: String,
    gen_elapsed_ms: u64,
    risk_source: Option<RiskSource>,
    risk_reason: Option<String>,
    error: Option<Error>,
}

/// What the synthesis half of the pipeline returned
struct SpeakResult {
    seg_count: usize,
    chunk_count: usize,
    ttfa_ms: Option<u64>,
    error: Option<Error>,
}

/// Orchestrates the provider stages for one session
#[derive(Clone)]
pub struct TurnPipeline {
    providers: ProviderSet,
    cfg: PipelineConfig,
    sample_rate: u32,
}

impl TurnPipeline {
    /// Create a pipeline bound to a provider set
    #[must_use]
    pub fn new(providers: ProviderSet, cfg: PipelineConfig, audio: &AudioConfig) -> Self {
        Self {
            providers,
            cfg,
            sample_rate: audio.sample_rate,
        }
    }

    /// Run one turn to completion, cancellation, or failure
    ///
    /// Always emits [`PipelineEvent::Finished`] as the final event, even on
    /// failure, so the session worker can rely on it for cleanup.
    pub async fn run(
        &self,
        utterance: Utterance,
        profile: DeviceProfile,
        history: Vec<HistoryTurn>,
        cancel: CancelFlag,
        events: mpsc::Sender<PipelineEvent>,
    ) {
        let outcome = self.drive(utterance, &profile, &history, &cancel, &events).await;
        if events
            .send(PipelineEvent::Finished(Box::new(outcome)))
            .await
            .is_err()
        {
            tracing::debug!("session worker gone before pipeline finished");
        }
    }

    async fn drive(
        &self,
        utterance: Utterance,
        profile: &DeviceProfile,
        history: &[HistoryTurn],
        cancel: &CancelFlag,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> TurnOutcome {
        let started = Instant::now();
        let mut outcome = TurnOutcome::new();

        if cancel.is_cancelled() {
            return outcome.cancelled();
        }

        // Stage 1: ASR
        let transcript = match self.transcribe(&utterance).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "transcription stage failed");
                return outcome.failed(&e);
            }
        };
        outcome.transcript.clone_from(&transcript);

        if cancel.is_cancelled() {
            return outcome.cancelled();
        }
        if events
            .send(PipelineEvent::Transcript(transcript.clone()))
            .await
            .is_err()
        {
            return outcome.cancelled();
        }

        // Stages 2+3 overlap: reply segments flow into synthesis as each
        // sentence completes
        let (seg_tx, seg_rx) = mpsc::channel::<String>(8);

        let producer = self.produce_reply(&transcript, profile, history, cancel, seg_tx, started);
        let consumer = self.speak_segments(seg_rx, cancel, events);
        let (produced, spoken) = tokio::join!(producer, consumer);

        outcome.reply_text = produced.reply_text;
        outcome.risk_source = produced.risk_source;
        outcome.risk_reason = produced.risk_reason.clone();
        outcome.metrics = TurnMetrics {
            gen_ms: produced.gen_elapsed_ms,
            ttfa_ms: spoken.ttfa_ms,
            seg_count: spoken.seg_count,
            chunk_count: spoken.chunk_count,
            resume_count: 0,
        };

        if cancel.is_cancelled() {
            return outcome.cancelled();
        }
        if let Some(e) = produced.error {
            tracing::warn!(error = %e, "generation stage failed");
            return outcome.failed(&e);
        }
        if let Some(e) = spoken.error {
            tracing::warn!(error = %e, "synthesis stage failed");
            return outcome.failed(&e);
        }

        outcome.status = TurnStatus::Completed;
        outcome
    }

    /// ASR with deadline; empty results become the configured placeholder
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        let text = timeout(
            std::time::Duration::from_millis(self.cfg.asr_timeout_ms),
            self.providers
                .asr
                .transcribe(utterance.pcm(), self.sample_rate),
        )
        .await
        .map_err(|_| Error::ProviderTimeout {
            stage: Stage::Asr,
            timeout_ms: self.cfg.asr_timeout_ms,
        })??;

        let text = text.trim().to_string();
        if text.is_empty() {
            Ok(self.cfg.empty_transcript_placeholder.clone())
        } else {
            Ok(text)
        }
    }

    /// Produce reply segments: safety gate, LLM stream, sentence chunking
    async fn produce_reply(
        &self,
        transcript: &str,
        profile: &DeviceProfile,
        history: &[HistoryTurn],
        cancel: &CancelFlag,
        seg_tx: mpsc::Sender<String>,
        turn_started: Instant,
    ) -> ProducerResult {
        let mut result = ProducerResult {
            reply_text: String::new(),
            gen_elapsed_ms: 0,
            risk_source: None,
            risk_reason: None,
            error: None,
        };

        // Input gate: a flagged utterance skips the LLM entirely
        if let Some(reason) = safety::screen(transcript, &profile.forbidden_topics) {
            tracing::info!(reason = %reason, "input flagged, substituting safe reply");
            let reply = safety::safe_reply(&profile.toy_name);
            result.risk_source = Some(RiskSource::Input);
            result.risk_reason = Some(reason);
            result.gen_elapsed_ms = elapsed_ms(turn_started);
            self.send_segments(&reply, &seg_tx).await;
            result.reply_text = reply;
            return result;
        }

        let messages =
            prompt::build_messages(profile, history, transcript, self.cfg.max_history_turns);
        let deadline =
            Instant::now() + std::time::Duration::from_millis(self.cfg.llm_timeout_ms);
        let llm_timeout_err = || Error::ProviderTimeout {
            stage: Stage::Llm,
            timeout_ms: self.cfg.llm_timeout_ms,
        };

        let mut stream = match timeout(
            deadline.saturating_duration_since(Instant::now()),
            self.providers.llm.generate(&messages),
        )
        .await
        {
            Err(_) => {
                result.error = Some(llm_timeout_err());
                return result;
            }
            Ok(Err(e)) => {
                result.error = Some(e);
                return result;
            }
            Ok(Ok(stream)) => stream,
        };

        let mut chunker =
            chunker::SentenceChunker::new(self.cfg.segment_max_chars, self.cfg.segment_min_chars);
        let mut spoken_segments: Vec<String> = Vec::new();
        let mut raw_reply = String::new();

        loop {
            if cancel.is_cancelled() {
                result.gen_elapsed_ms = elapsed_ms(turn_started);
                result.reply_text = raw_reply;
                return result;
            }

            let fragment = match timeout(
                deadline.saturating_duration_since(Instant::now()),
                stream.next(),
            )
            .await
            {
                Err(_) => {
                    result.error = Some(llm_timeout_err());
                    result.reply_text = raw_reply;
                    return result;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    result.error = Some(e);
                    result.reply_text = raw_reply;
                    return result;
                }
                Ok(Some(Ok(fragment))) => fragment,
            };

            raw_reply.push_str(&fragment);
            for segment in chunker.push(&fragment) {
                if !self
                    .gate_and_send(segment, profile, &seg_tx, &mut spoken_segments, &mut result)
                    .await
                {
                    result.gen_elapsed_ms = elapsed_ms(turn_started);
                    return result;
                }
            }
        }

        for segment in chunker.finish() {
            if !self
                .gate_and_send(segment, profile, &seg_tx, &mut spoken_segments, &mut result)
                .await
            {
                result.gen_elapsed_ms = elapsed_ms(turn_started);
                return result;
            }
        }

        result.gen_elapsed_ms = elapsed_ms(turn_started);
        result.reply_text = if raw_reply.trim().is_empty() {
            // The model produced nothing speakable; fall back like a flagged turn
            let reply = safety::safe_reply(&profile.toy_name);
            result.risk_source = Some(RiskSource::Output);
            result.risk_reason = Some("empty reply".to_string());
            self.send_segments(&reply, &seg_tx).await;
            reply
        } else {
            raw_reply
        };
        result
    }

    /// Screen one segment and forward it; on a flagged segment, substitute
    /// the safe reply for the remainder and stop.
    ///
    /// Returns false when production should stop (risk substitution or the
    /// consumer went away).
    async fn gate_and_send(
        &self,
        segment: String,
        profile: &DeviceProfile,
        seg_tx: &mpsc::Sender<String>,
        spoken: &mut Vec<String>,
        result: &mut ProducerResult,
    ) -> bool {
        if let Some(reason) = safety::screen(&segment, &profile.forbidden_topics) {
            tracing::info!(reason = %reason, "reply segment flagged, substituting safe reply");
            let fallback = safety::safe_reply(&profile.toy_name);
            result.risk_source = Some(RiskSource::Output);
            result.risk_reason = Some(reason);
            self.send_segments(&fallback, seg_tx).await;

            let mut reply = spoken.join(" ");
            if !reply.is_empty() {
                reply.push(' ');
            }
            reply.push_str(&fallback);
            result.reply_text = reply;
            return false;
        }

        spoken.push(segment.clone());
        seg_tx.send(segment).await.is_ok()
    }

    /// Segment a complete reply and push everything to the consumer
    async fn send_segments(&self, reply: &str, seg_tx: &mpsc::Sender<String>) {
        for segment in chunker::segment_text(
            reply,
            self.cfg.segment_max_chars,
            self.cfg.segment_min_chars,
        ) {
            if seg_tx.send(segment).await.is_err() {
                return;
            }
        }
    }

    /// Synthesize segments sequentially, forwarding chunks as they arrive
    async fn speak_segments(
        &self,
        mut seg_rx: mpsc::Receiver<String>,
        cancel: &CancelFlag,
        events: &mpsc::Sender<PipelineEvent>,
    ) -> SpeakResult {
        let mut result = SpeakResult {
            seg_count: 0,
            chunk_count: 0,
            ttfa_ms: None,
            error: None,
        };
        let tts_deadline = std::time::Duration::from_millis(self.cfg.tts_timeout_ms);
        let mut tts_started: Option<Instant> = None;

        while let Some(segment) = seg_rx.recv().await {
            if cancel.is_cancelled() {
                // No further provider calls; closing the receiver tells the
                // producer to stop
                return result;
            }

            result.seg_count += 1;
            if tts_started.is_none() {
                tts_started = Some(Instant::now());
                if events.send(PipelineEvent::TtsStarted).await.is_err() {
                    return result;
                }
            }

            let mut chunks =
                match timeout(tts_deadline, self.providers.tts.synthesize(&segment)).await {
                    Err(_) => {
                        result.error = Some(Error::ProviderTimeout {
                            stage: Stage::Tts,
                            timeout_ms: self.cfg.tts_timeout_ms,
                        });
                        return result;
                    }
                    Ok(Err(e)) => {
                        result.error = Some(e);
                        return result;
                    }
                    Ok(Ok(stream)) => stream,
                };

            // The in-flight call is allowed to complete even under
            // cancellation: its tail is handed to the session, which retains
            // rather than forwards it once the turn is flagged
            loop {
                match timeout(tts_deadline, chunks.next()).await {
                    Err(_) => {
                        result.error = Some(Error::ProviderTimeout {
                            stage: Stage::Tts,
                            timeout_ms: self.cfg.tts_timeout_ms,
                        });
                        return result;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        result.error = Some(e);
                        return result;
                    }
                    Ok(Some(Ok(chunk))) => {
                        result.chunk_count += 1;
                        if result.ttfa_ms.is_none() {
                            result.ttfa_ms = tts_started.map(elapsed_ms);
                        }
                        if events.send(PipelineEvent::AudioChunk(chunk)).await.is_err() {
                            return result;
                        }
                    }
                }
            }

            if cancel.is_cancelled() {
                return result;
            }
        }

        result
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmenterConfig;
    use crate::providers::{DummyAsr, DummyLlm, DummyTts, LlmProvider, TextStream};
    use crate::segment::UtteranceBuffer;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn utterance() -> Utterance {
        let mut buf = UtteranceBuffer::new(&AudioConfig::default(), &SegmenterConfig::default());
        buf.begin();
        buf.append(&[0u8; 6400]).unwrap();
        buf.finalize().unwrap()
    }

    fn pipeline_with(providers: ProviderSet) -> TurnPipeline {
        TurnPipeline::new(providers, PipelineConfig::default(), &AudioConfig::default())
    }

    async fn collect_events(
        pipeline: &TurnPipeline,
        asr_text: Option<&str>,
        cancel: &CancelFlag,
    ) -> Vec<PipelineEvent> {
        let providers = if let Some(text) = asr_text {
            ProviderSet {
                asr: Arc::new(DummyAsr::new(text)),
                ..ProviderSet::dummy()
            }
        } else {
            pipeline.providers.clone()
        };
        let pipeline = TurnPipeline::new(
            providers,
            pipeline.cfg.clone(),
            &AudioConfig::default(),
        );

        let (tx, mut rx) = mpsc::channel(64);
        pipeline
            .run(
                utterance(),
                DeviceProfile::fallback("toy-001"),
                Vec::new(),
                cancel.clone(),
                tx,
            )
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn finished(events: &[PipelineEvent]) -> &TurnOutcome {
        match events.last() {
            Some(PipelineEvent::Finished(outcome)) => outcome,
            other => panic!("expected Finished as last event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_completes_with_ordered_stages() {
        let pipeline = pipeline_with(ProviderSet::dummy());
        let events = collect_events(&pipeline, None, &CancelFlag::new()).await;

        assert!(matches!(events[0], PipelineEvent::Transcript(_)));
        assert!(matches!(events[1], PipelineEvent::TtsStarted));
        let chunks = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::AudioChunk(_)))
            .count();
        assert!(chunks > 0);

        let outcome = finished(&events);
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.transcript, "Hello buddy!");
        assert!(!outcome.reply_text.is_empty());
        assert_eq!(outcome.metrics.chunk_count, chunks);
        assert!(outcome.metrics.seg_count > 0);
    }

    #[tokio::test]
    async fn pre_cancelled_turn_calls_no_providers() {
        let asr = Arc::new(DummyAsr::default());
        let counting_asr: Arc<dyn crate::providers::AsrProvider> = asr.clone();
        let providers = ProviderSet {
            asr: counting_asr,
            ..ProviderSet::dummy()
        };
        let pipeline = pipeline_with(providers);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let events = collect_events(&pipeline, None, &cancel).await;

        assert_eq!(events.len(), 1);
        assert_eq!(finished(&events).status, TurnStatus::Cancelled);
        assert_eq!(asr.calls(), 0);
    }

    #[tokio::test]
    async fn flagged_input_substitutes_safe_reply() {
        let llm = Arc::new(DummyLlm::default());
        let counting_llm: Arc<dyn LlmProvider> = llm.clone();
        let providers = ProviderSet {
            asr: Arc::new(DummyAsr::new("tell me about a weapon")),
            llm: counting_llm,
            tts: Arc::new(DummyTts::default()),
        };
        let pipeline = pipeline_with(providers);
        let events = collect_events(&pipeline, None, &CancelFlag::new()).await;

        let outcome = finished(&events);
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.risk_source, Some(RiskSource::Input));
        assert_eq!(outcome.risk_reason.as_deref(), Some("weapon"));
        assert!(outcome.reply_text.starts_with("Buddy"));
        // The LLM is never consulted for a flagged utterance
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn flagged_reply_segment_is_replaced() {
        let providers = ProviderSet {
            llm: Arc::new(DummyLlm::new(&[
                "Let me tell you about gamble dens today.",
                " More after that.",
            ])),
            ..ProviderSet::dummy()
        };
        let pipeline = pipeline_with(providers);
        let events = collect_events(&pipeline, None, &CancelFlag::new()).await;

        let outcome = finished(&events);
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.risk_source, Some(RiskSource::Output));
        assert!(outcome.reply_text.contains("something fun instead"));
        assert!(!outcome.reply_text.contains("gamble"));
    }

    struct StalledLlm;

    #[async_trait]
    impl LlmProvider for StalledLlm {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn generate(&self, _messages: &[crate::prompt::ChatMessage]) -> Result<TextStream> {
            Ok(futures::stream::pending().boxed())
        }
    }

    #[tokio::test]
    async fn llm_timeout_fails_the_turn() {
        let providers = ProviderSet {
            llm: Arc::new(StalledLlm),
            ..ProviderSet::dummy()
        };
        let cfg = PipelineConfig {
            llm_timeout_ms: 50,
            ..PipelineConfig::default()
        };
        let pipeline = TurnPipeline::new(providers, cfg, &AudioConfig::default());

        let (tx, mut rx) = mpsc::channel(64);
        pipeline
            .run(
                utterance(),
                DeviceProfile::fallback("toy-001"),
                Vec::new(),
                CancelFlag::new(),
                tx,
            )
            .await;

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(PipelineEvent::Finished(outcome)) => {
                assert_eq!(outcome.status, TurnStatus::Failed);
                assert!(outcome.failure.unwrap().contains("timed out"));
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_transcript_uses_placeholder() {
        let pipeline = pipeline_with(ProviderSet::dummy());
        let events = collect_events(&pipeline, Some("   "), &CancelFlag::new()).await;
        assert_eq!(finished(&events).transcript, "(no speech recognized)");
    }
}
