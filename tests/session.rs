//! End-to-end session scenarios driven through the session manager
//!
//! Devices are simulated by routing PCM frames and control commands directly,
//! with dummy or purpose-built providers standing in for the real backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buddy_gateway::Error;
use buddy_gateway::config::Config;
use buddy_gateway::prompt::ChatMessage;
use buddy_gateway::providers::{
    AudioStream, DummyAsr, DummyLlm, DummyTts, LlmProvider, ProviderSet, TextStream, TtsProvider,
};
use buddy_gateway::recorder::{RecordedOutcome, RecorderEvent};
use buddy_gateway::session::{ControlCommand, Outbound, SessionEvent};
use futures::StreamExt;

mod common;
use common::{feed_frames, manager_with, recv_outbound, silence_frame, speech_frame};

/// TTS that paces out `chunks` marker chunks; chunk i is 320 bytes of value i
struct PacedTts {
    chunks: usize,
    delay_ms: u64,
}

impl PacedTts {
    fn new(chunks: usize, delay_ms: u64) -> Self {
        Self { chunks, delay_ms }
    }
}

#[async_trait]
impl TtsProvider for PacedTts {
    fn name(&self) -> &'static str {
        "paced"
    }

    async fn synthesize(&self, _text: &str) -> buddy_gateway::Result<AudioStream> {
        let total = self.chunks;
        let delay = self.delay_ms;
        Ok(futures::stream::unfold(0usize, move |i| async move {
            if i >= total {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(delay)).await;
            #[allow(clippy::cast_possible_truncation)]
            Some((Ok(vec![i as u8; 320]), i + 1))
        })
        .boxed())
    }
}

/// LLM whose stream never yields, for exercising deadlines
struct StalledLlm;

#[async_trait]
impl LlmProvider for StalledLlm {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> buddy_gateway::Result<TextStream> {
        Ok(futures::stream::pending().boxed())
    }
}

/// LLM that never even returns a stream
struct HungLlm;

#[async_trait]
impl LlmProvider for HungLlm {
    fn name(&self) -> &'static str {
        "hung"
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> buddy_gateway::Result<TextStream> {
        Ok(std::future::pending().await)
    }
}

/// Pull events until one matches, panicking if audio shows up when forbidden
async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<Outbound>) -> SessionEvent {
    loop {
        if let Outbound::Event(event) = recv_outbound(rx).await {
            return event;
        }
    }
}

#[tokio::test]
async fn end_to_end_single_turn() {
    let asr = Arc::new(DummyAsr::default());
    let llm = Arc::new(DummyLlm::new(&["Okay! Let's imagine a friendly dragon."]));
    let tts = Arc::new(DummyTts::default());
    let providers = ProviderSet {
        asr: asr.clone(),
        llm: llm.clone(),
        tts: tts.clone(),
    };
    let (manager, mut recorder_rx) = manager_with(Config::default(), providers);

    let mut rx = manager.open("toy-001").await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Ready { .. }
    ));

    // 2s silence, 1.5s speech, 2s silence at 20ms frames
    feed_frames(&manager, "toy-001", &silence_frame(), 100).await;
    feed_frames(&manager, "toy-001", &speech_frame(), 75).await;
    feed_frames(&manager, "toy-001", &silence_frame(), 100).await;

    assert!(matches!(next_event(&mut rx).await, SessionEvent::SpeechStart));
    assert!(matches!(next_event(&mut rx).await, SessionEvent::SpeechEnd));

    match next_event(&mut rx).await {
        SessionEvent::TurnStarted { seq, transcript, .. } => {
            assert_eq!(seq, 1);
            assert_eq!(transcript, "Hello buddy!");
        }
        other => panic!("expected TurnStarted, got {other:?}"),
    }
    assert!(matches!(next_event(&mut rx).await, SessionEvent::TtsStart { .. }));

    // Audio chunks stream until TurnEnd
    let mut audio_chunks = 0usize;
    let metrics = loop {
        match recv_outbound(&mut rx).await {
            Outbound::Audio(pcm) => {
                assert!(!pcm.is_empty());
                audio_chunks += 1;
            }
            Outbound::Event(SessionEvent::TurnEnd {
                seq,
                reply_text,
                metrics,
                ..
            }) => {
                assert_eq!(seq, 1);
                assert_eq!(reply_text, "Okay! Let's imagine a friendly dragon.");
                break metrics;
            }
            Outbound::Event(other) => panic!("unexpected event {other:?}"),
        }
    };
    assert!(audio_chunks > 0);
    assert_eq!(metrics.chunk_count, audio_chunks);
    assert_eq!(metrics.resume_count, 0);
    assert!(matches!(next_event(&mut rx).await, SessionEvent::TtsEnd { .. }));

    // Each provider was invoked exactly once (single-segment reply)
    assert_eq!(asr.calls(), 1);
    assert_eq!(llm.calls(), 1);
    assert_eq!(tts.calls(), 1);

    // Recorder saw the session open and the completed turn
    let mut saw_open = false;
    let mut saw_completed = false;
    while let Ok(event) = recorder_rx.try_recv() {
        match event {
            RecorderEvent::SessionOpened { device_sn, .. } => {
                assert_eq!(device_sn, "toy-001");
                saw_open = true;
            }
            RecorderEvent::Turn(record) => {
                assert_eq!(record.outcome, RecordedOutcome::Completed);
                assert_eq!(record.seq, 1);
                assert!(record.risk_source.is_none());
                saw_completed = true;
            }
            _ => {}
        }
    }
    assert!(saw_open && saw_completed);
}

#[tokio::test]
async fn barge_in_then_explicit_resume_replays_unsent_tail() {
    const TOTAL_CHUNKS: usize = 40;

    let providers = ProviderSet {
        asr: Arc::new(DummyAsr::default()),
        llm: Arc::new(DummyLlm::new(&["Here is a nice long story for you."])),
        tts: Arc::new(PacedTts::new(TOTAL_CHUNKS, 50)),
    };
    let (manager, _recorder_rx) = manager_with(Config::default(), providers);

    let mut rx = manager.open("toy-002").await.unwrap();

    feed_frames(&manager, "toy-002", &speech_frame(), 10).await;
    feed_frames(&manager, "toy-002", &silence_frame(), 15).await;

    // Let a few chunks through, then barge in
    let mut received: Vec<u8> = Vec::new();
    while received.len() < 3 {
        if let Outbound::Audio(pcm) = recv_outbound(&mut rx).await {
            received.push(pcm[0]);
        }
    }
    feed_frames(&manager, "toy-002", &speech_frame(), 4).await;

    // After the interrupt is announced, zero further chunks may arrive
    let paused = loop {
        match recv_outbound(&mut rx).await {
            Outbound::Audio(pcm) => received.push(pcm[0]),
            Outbound::Event(SessionEvent::InterruptRequested { reason, .. }) => {
                assert_eq!(reason, "barge_in");
                break loop {
                    match recv_outbound(&mut rx).await {
                        Outbound::Audio(_) => panic!("audio leaked past the interrupt"),
                        Outbound::Event(event @ SessionEvent::TtsPaused { .. }) => break event,
                        Outbound::Event(_) => {}
                    }
                };
            }
            Outbound::Event(_) => {}
        }
    };
    let SessionEvent::TtsPaused {
        chunks_sent,
        can_resume,
        ..
    } = paused
    else {
        unreachable!()
    };
    assert!(can_resume);
    assert_eq!(chunks_sent, received.len());
    assert!(chunks_sent < TOTAL_CHUNKS);

    // Resume: the retained tail replays from the first unsent chunk
    manager
        .control("toy-002", ControlCommand::Resume)
        .await
        .unwrap();

    match next_event(&mut rx).await {
        SessionEvent::ResumeStarted { chunk_index, .. } => {
            assert_eq!(chunk_index, received.len());
        }
        other => panic!("expected ResumeStarted, got {other:?}"),
    }

    loop {
        match recv_outbound(&mut rx).await {
            Outbound::Audio(pcm) => received.push(pcm[0]),
            Outbound::Event(SessionEvent::TurnEnd { metrics, .. }) => {
                assert_eq!(metrics.resume_count, 1);
                break;
            }
            Outbound::Event(_) => {}
        }
    }
    assert!(matches!(next_event(&mut rx).await, SessionEvent::TtsEnd { .. }));

    // Every produced chunk arrived exactly once, in production order
    assert_eq!(received.len(), TOTAL_CHUNKS);
    #[allow(clippy::cast_possible_truncation)]
    for (i, marker) in received.iter().enumerate() {
        assert_eq!(*marker, i as u8, "chunk {i} out of order");
    }
}

#[tokio::test]
async fn duplicate_open_is_rejected_and_first_survives() {
    let (manager, _recorder_rx) = manager_with(Config::default(), ProviderSet::dummy());

    let mut rx = manager.open("toy-003").await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Ready { .. }
    ));

    let err = manager.open("toy-003").await.unwrap_err();
    assert!(matches!(err, Error::StateConflict(_)));

    // The first session keeps working
    manager
        .route_frame("toy-003", silence_frame())
        .await
        .unwrap();
    assert_eq!(manager.active_count().await, 1);
}

#[tokio::test]
async fn llm_timeout_fails_turn_but_keeps_session_listening() {
    let mut config = Config::default();
    config.pipeline.llm_timeout_ms = 100;
    let providers = ProviderSet {
        llm: Arc::new(StalledLlm),
        ..ProviderSet::dummy()
    };
    let (manager, mut recorder_rx) = manager_with(config, providers);

    let mut rx = manager.open("toy-004").await.unwrap();

    feed_frames(&manager, "toy-004", &speech_frame(), 10).await;
    feed_frames(&manager, "toy-004", &silence_frame(), 15).await;

    let error = loop {
        match next_event(&mut rx).await {
            SessionEvent::Error { code, message } => break (code, message),
            SessionEvent::TtsStart { .. } => panic!("synthesis must not start"),
            _ => {}
        }
    };
    assert_eq!(error.0, "turn_failed");
    assert!(error.1.contains("timed out"));

    // The channel stays open: a second utterance spawns a fresh turn
    feed_frames(&manager, "toy-004", &speech_frame(), 10).await;
    feed_frames(&manager, "toy-004", &silence_frame(), 15).await;

    loop {
        if let SessionEvent::TurnStarted { seq, .. } = next_event(&mut rx).await {
            assert_eq!(seq, 2);
            break;
        }
    }

    let mut saw_failed = false;
    while let Ok(event) = recorder_rx.try_recv() {
        if let RecorderEvent::Turn(record) = event {
            if record.outcome == RecordedOutcome::Failed {
                assert_eq!(record.seq, 1);
                saw_failed = true;
            }
        }
    }
    assert!(saw_failed, "expected a failed turn record");
}

#[tokio::test]
async fn buffer_overflow_drops_utterance_and_recovers() {
    let mut config = Config::default();
    config.segmenter.max_buffer_bytes = 4000;
    // Short silence hold so a small utterance fits under the byte cap
    config.segmenter.speech_end_silence_frames = 3;
    let (manager, _recorder_rx) = manager_with(config, ProviderSet::dummy());

    let mut rx = manager.open("toy-005").await.unwrap();

    // Enough speech to blow the 4000-byte cap (~6 frames)
    feed_frames(&manager, "toy-005", &speech_frame(), 10).await;

    let error = loop {
        match next_event(&mut rx).await {
            SessionEvent::Error { code, .. } => break code,
            SessionEvent::SpeechEnd | SessionEvent::TurnStarted { .. } => {
                panic!("oversized utterance must not produce a turn")
            }
            _ => {}
        }
    };
    assert_eq!(error, "capacity_exceeded");

    // Back to listening: a small utterance now completes a turn
    feed_frames(&manager, "toy-005", &silence_frame(), 10).await;
    feed_frames(&manager, "toy-005", &speech_frame(), 3).await;
    feed_frames(&manager, "toy-005", &silence_frame(), 10).await;

    loop {
        if let SessionEvent::TurnStarted { seq, .. } = next_event(&mut rx).await {
            assert_eq!(seq, 1);
            break;
        }
    }
}

#[tokio::test]
async fn max_duration_force_finalizes_without_silence() {
    let mut config = Config::default();
    config.segmenter.max_utterance_ms = 500;
    let (manager, _recorder_rx) = manager_with(config, ProviderSet::dummy());

    let mut rx = manager.open("toy-006").await.unwrap();

    // Continuous speech, no silence at all
    feed_frames(&manager, "toy-006", &speech_frame(), 60).await;

    let mut saw_end = false;
    loop {
        match next_event(&mut rx).await {
            SessionEvent::SpeechEnd => saw_end = true,
            SessionEvent::TurnStarted { .. } => break,
            _ => {}
        }
    }
    assert!(saw_end, "expected a forced end boundary");
}

#[tokio::test]
async fn new_utterance_supersedes_unfinished_turn() {
    let providers = ProviderSet {
        llm: Arc::new(HungLlm),
        ..ProviderSet::dummy()
    };
    let (manager, mut recorder_rx) = manager_with(Config::default(), providers);

    let mut rx = manager.open("toy-007").await.unwrap();

    // First utterance: the turn wedges inside the LLM call
    feed_frames(&manager, "toy-007", &speech_frame(), 10).await;
    feed_frames(&manager, "toy-007", &silence_frame(), 15).await;
    loop {
        if let SessionEvent::TurnStarted { seq, .. } = next_event(&mut rx).await {
            assert_eq!(seq, 1);
            break;
        }
    }

    // Second utterance barges in and replaces it
    feed_frames(&manager, "toy-007", &speech_frame(), 10).await;
    feed_frames(&manager, "toy-007", &silence_frame(), 15).await;

    let mut saw_interrupt = false;
    loop {
        match next_event(&mut rx).await {
            SessionEvent::InterruptRequested { .. } => saw_interrupt = true,
            SessionEvent::TurnStarted { seq, .. } => {
                assert_eq!(seq, 2);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_interrupt);

    // The superseded turn was recorded as cancelled before the new one began
    let cancelled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(RecorderEvent::Turn(record)) = recorder_rx.recv().await {
                if record.outcome == RecordedOutcome::Cancelled {
                    return record;
                }
            }
        }
    })
    .await
    .expect("expected a cancelled turn record");
    assert_eq!(cancelled.seq, 1);
}

#[tokio::test]
async fn resume_without_retained_audio_is_rejected() {
    let (manager, _recorder_rx) = manager_with(Config::default(), ProviderSet::dummy());

    let mut rx = manager.open("toy-008").await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Ready { .. }
    ));

    manager
        .control("toy-008", ControlCommand::Resume)
        .await
        .unwrap();

    match next_event(&mut rx).await {
        SessionEvent::ResumeRejected { reason } => assert_eq!(reason, "no_pending"),
        other => panic!("expected ResumeRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_gets_pong() {
    let (manager, _recorder_rx) = manager_with(Config::default(), ProviderSet::dummy());

    let mut rx = manager.open("toy-009").await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Ready { .. }
    ));

    manager
        .control("toy-009", ControlCommand::Ping)
        .await
        .unwrap();
    assert!(matches!(next_event(&mut rx).await, SessionEvent::Pong));
}

#[tokio::test]
async fn close_tears_down_session() {
    let (manager, mut recorder_rx) = manager_with(Config::default(), ProviderSet::dummy());

    let mut rx = manager.open("toy-010").await.unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Ready { .. }
    ));

    manager.close("toy-010").await.unwrap();
    assert_eq!(manager.active_count().await, 0);

    // The worker drains and the outbound channel closes
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "outbound channel should close");

    // Routing to a closed session fails
    let err = manager
        .route_frame("toy-010", silence_frame())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    let session_closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(RecorderEvent::SessionClosed { device_sn, .. }) = recorder_rx.recv().await {
                return device_sn;
            }
        }
    })
    .await
    .expect("expected a session closed record");
    assert_eq!(session_closed, "toy-010");
}
