//! Voice activity segmentation
//!
//! Classifies inbound PCM frames as speech or silence and emits utterance
//! boundaries once a transition has persisted for the configured hold time.
//! This is a pure stream transform: no external calls, cheap enough to run
//! inline for every frame.

mod utterance;

pub use utterance::{AppendResult, Utterance, UtteranceBuffer};

use crate::audio;
use crate::config::{AudioConfig, SegmenterConfig};

/// Classification of a single PCM frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Frame energy above the speech threshold
    Speech,
    /// Frame energy at or below the speech threshold
    Silence,
}

/// Utterance boundary emitted by the endpoint detector
///
/// `frame_offset` counts frames since the detector was created, so callers
/// can correlate boundaries with the inbound stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Sustained speech began
    SpeechStart {
        /// Frame index at which the boundary was confirmed
        frame_offset: u64,
    },
    /// Sustained silence (or the max-utterance cutoff) ended the utterance
    SpeechEnd {
        /// Frame index at which the boundary was confirmed
        frame_offset: u64,
    },
}

/// Per-frame speech/silence decision
pub trait VoiceDetector: Send + Sync {
    /// Classify one frame of samples
    fn is_speech(&mut self, frame: &[i16]) -> bool;
}

/// RMS energy threshold detector
///
/// Robust enough for close-mic toy hardware and has no per-frame allocation.
pub struct EnergyVoiceDetector {
    threshold: f64,
}

impl EnergyVoiceDetector {
    /// Create a detector with the given RMS threshold
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl VoiceDetector for EnergyVoiceDetector {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        !frame.is_empty() && audio::rms(frame) >= self.threshold
    }
}

/// Streaming endpoint detector
///
/// Accepts arbitrary-length PCM byte chunks, re-frames them to the configured
/// frame duration, and emits [`Boundary`] events when a speech or silence run
/// persists long enough. An utterance that outlives `max_utterance_ms` is
/// force-ended without waiting for silence.
pub struct EndpointDetector {
    detector: Box<dyn VoiceDetector>,
    frame_bytes: usize,
    speech_start_frames: u32,
    speech_end_silence_frames: u32,
    max_utterance_frames: u64,

    buf: Vec<u8>,
    in_speech: bool,
    speech_run: u32,
    silence_run: u32,
    utterance_frames: u64,
    frames_seen: u64,
}

impl EndpointDetector {
    /// Create a detector with the default energy classifier
    #[must_use]
    pub fn new(audio: &AudioConfig, cfg: &SegmenterConfig) -> Self {
        Self::with_detector(
            audio,
            cfg,
            Box::new(EnergyVoiceDetector::new(cfg.rms_threshold)),
        )
    }

    /// Create a detector with a custom frame classifier
    #[must_use]
    pub fn with_detector(
        audio: &AudioConfig,
        cfg: &SegmenterConfig,
        detector: Box<dyn VoiceDetector>,
    ) -> Self {
        Self {
            detector,
            frame_bytes: audio.frame_bytes(),
            speech_start_frames: cfg.speech_start_frames,
            speech_end_silence_frames: cfg.speech_end_silence_frames,
            max_utterance_frames: cfg.max_utterance_ms / u64::from(audio.frame_ms),
            buf: Vec::with_capacity(audio.frame_bytes() * 4),
            in_speech: false,
            speech_run: 0,
            silence_run: 0,
            utterance_frames: 0,
            frames_seen: 0,
        }
    }

    /// Whether the detector is currently inside an utterance
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Process a PCM byte chunk, returning boundaries in detection order
    ///
    /// At most one `SpeechStart` and one `SpeechEnd` can be produced per
    /// frame contained in the chunk.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<Boundary> {
        let mut boundaries = Vec::new();
        if chunk.is_empty() {
            return boundaries;
        }

        self.buf.extend_from_slice(chunk);

        while self.buf.len() >= self.frame_bytes {
            let frame_bytes: Vec<u8> = self.buf.drain(..self.frame_bytes).collect();
            let frame = audio::pcm_to_samples(&frame_bytes);
            if let Some(boundary) = self.process_frame(&frame) {
                boundaries.push(boundary);
            }
        }

        boundaries
    }

    /// Classify one frame and update run counters
    fn process_frame(&mut self, frame: &[i16]) -> Option<Boundary> {
        let is_speech = self.detector.is_speech(frame);
        self.frames_seen += 1;

        if is_speech {
            self.speech_run += 1;
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
            self.speech_run = 0;
        }

        if self.in_speech {
            self.utterance_frames += 1;

            let silence_elapsed =
                !is_speech && self.silence_run >= self.speech_end_silence_frames;
            let too_long = self.utterance_frames >= self.max_utterance_frames;

            if silence_elapsed || too_long {
                if too_long {
                    tracing::debug!(
                        frames = self.utterance_frames,
                        "utterance hit max duration, force-ending"
                    );
                }
                self.in_speech = false;
                self.speech_run = 0;
                self.silence_run = 0;
                self.utterance_frames = 0;
                return Some(Boundary::SpeechEnd {
                    frame_offset: self.frames_seen,
                });
            }
        } else if is_speech && self.speech_run >= self.speech_start_frames {
            self.in_speech = true;
            self.silence_run = 0;
            self.utterance_frames = u64::from(self.speech_run);
            return Some(Boundary::SpeechStart {
                frame_offset: self.frames_seen,
            });
        }

        None
    }

    /// Discard buffered bytes and counters, leaving the frame offset intact
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_speech = false;
        self.speech_run = 0;
        self.silence_run = 0;
        self.utterance_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_pcm;

    fn detector() -> EndpointDetector {
        EndpointDetector::new(&AudioConfig::default(), &SegmenterConfig::default())
    }

    /// One 20ms frame of constant amplitude
    fn frame(amplitude: i16) -> Vec<u8> {
        samples_to_pcm(&vec![amplitude; 320])
    }

    fn feed_frames(det: &mut EndpointDetector, amplitude: i16, count: usize) -> Vec<Boundary> {
        let mut out = Vec::new();
        for _ in 0..count {
            out.extend(det.process(&frame(amplitude)));
        }
        out
    }

    #[test]
    fn silence_emits_no_boundaries() {
        let mut det = detector();
        assert!(feed_frames(&mut det, 0, 200).is_empty());
        assert!(!det.in_speech());
    }

    #[test]
    fn sustained_speech_opens_after_hold() {
        let mut det = detector();

        // Below the 3-frame hold: nothing yet
        assert!(feed_frames(&mut det, 3000, 2).is_empty());

        let boundaries = feed_frames(&mut det, 3000, 1);
        assert_eq!(
            boundaries,
            vec![Boundary::SpeechStart { frame_offset: 3 }]
        );
        assert!(det.in_speech());
    }

    #[test]
    fn speech_blip_shorter_than_hold_ignored() {
        let mut det = detector();
        feed_frames(&mut det, 3000, 2);
        // Silence resets the run before the hold is met
        assert!(feed_frames(&mut det, 0, 5).is_empty());
        assert!(feed_frames(&mut det, 3000, 2).is_empty());
        assert!(!det.in_speech());
    }

    #[test]
    fn silence_hold_closes_utterance() {
        let mut det = detector();
        feed_frames(&mut det, 3000, 10);
        assert!(det.in_speech());

        // 11 silence frames: still open
        assert!(feed_frames(&mut det, 0, 11).is_empty());
        // 12th closes it
        let boundaries = feed_frames(&mut det, 0, 1);
        assert!(matches!(boundaries[..], [Boundary::SpeechEnd { .. }]));
        assert!(!det.in_speech());
    }

    #[test]
    fn single_segment_emits_one_start_one_end() {
        // 2s silence, 1.5s speech, 2s silence at 20ms frames
        let mut det = detector();
        let mut boundaries = Vec::new();
        boundaries.extend(feed_frames(&mut det, 0, 100));
        boundaries.extend(feed_frames(&mut det, 3000, 75));
        boundaries.extend(feed_frames(&mut det, 0, 100));

        assert_eq!(boundaries.len(), 2);
        assert!(matches!(boundaries[0], Boundary::SpeechStart { .. }));
        assert!(matches!(boundaries[1], Boundary::SpeechEnd { .. }));
    }

    #[test]
    fn max_duration_force_ends_without_silence() {
        let audio = AudioConfig::default();
        let cfg = SegmenterConfig {
            max_utterance_ms: 1000,
            ..SegmenterConfig::default()
        };
        let mut det = EndpointDetector::new(&audio, &cfg);

        // Continuous speech, never any silence
        let boundaries = feed_frames(&mut det, 3000, 60);
        assert!(matches!(boundaries[0], Boundary::SpeechStart { .. }));
        assert!(
            boundaries[1..]
                .iter()
                .any(|b| matches!(b, Boundary::SpeechEnd { .. })),
            "expected a forced end boundary, got {boundaries:?}"
        );
    }

    #[test]
    fn partial_frames_are_reassembled() {
        let mut det = detector();
        let full = frame(3000);

        // Feed half-frames; boundaries should still fire on frame cadence
        let mut boundaries = Vec::new();
        for _ in 0..8 {
            boundaries.extend(det.process(&full[..320]));
            boundaries.extend(det.process(&full[320..]));
        }
        assert!(
            boundaries
                .iter()
                .any(|b| matches!(b, Boundary::SpeechStart { .. }))
        );
    }
}
