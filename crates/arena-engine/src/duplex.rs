//! Turn detection for duplex conversations (spec §4.7 item 2): deciding,
//! from a stream of timed speech/silence audio frames, when a user's
//! utterance has ended and the turn is ready to hand off.
//!
//! The audio transport itself is out of scope (no audio codec crate
//! appears anywhere in the corpus — DESIGN.md); `AudioFrame` models only
//! the timing a transport would report, so the detection decision is a
//! pure function of that timing and is exercised the same way regardless
//! of what produced the frames (a live microphone, or the selfplay
//! persona's synthesized utterance).

use arena_domain::model::{DuplexSpec, TurnDetectionMode};

/// One timed frame of a duplex audio stream.
#[derive(Debug, Clone, Copy)]
pub struct AudioFrame {
    pub is_speech: bool,
    pub duration_ms: u64,
    /// Set by the provider transport when it has signaled its own turn
    /// boundary. Only consulted in `Asm` mode.
    pub provider_boundary: bool,
}

impl AudioFrame {
    pub fn speech(duration_ms: u64) -> Self {
        Self {
            is_speech: true,
            duration_ms,
            provider_boundary: false,
        }
    }

    pub fn silence(duration_ms: u64) -> Self {
        Self {
            is_speech: false,
            duration_ms,
            provider_boundary: false,
        }
    }

    pub fn with_provider_boundary(mut self) -> Self {
        self.provider_boundary = true;
        self
    }
}

/// Frame-by-frame turn-boundary accumulator (spec §4.7 item 2):
///
/// - `Asm`: the boundary is whatever the provider's own transport
///   signals; client-side timing is irrelevant.
/// - `Vad`: the boundary fires once accumulated speech reaches
///   `min_speech_ms` and the speech is *followed* by `silence_threshold_ms`
///   of silence. Any further speech resets the silence accumulator (the
///   user started talking again before the turn closed).
pub struct TurnDetector {
    mode: TurnDetectionMode,
    silence_threshold_ms: u64,
    min_speech_ms: u64,
    speech_ms: u64,
    silence_ms: u64,
}

impl TurnDetector {
    pub fn new(spec: &DuplexSpec) -> Self {
        Self {
            mode: spec.turn_detection,
            silence_threshold_ms: spec.silence_threshold_ms,
            min_speech_ms: spec.min_speech_ms,
            speech_ms: 0,
            silence_ms: 0,
        }
    }

    /// Feeds one frame. Returns `true` the instant this frame completes
    /// the turn boundary.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        match self.mode {
            TurnDetectionMode::Asm => frame.provider_boundary,
            TurnDetectionMode::Vad => {
                if frame.is_speech {
                    self.speech_ms += frame.duration_ms;
                    self.silence_ms = 0;
                } else {
                    self.silence_ms += frame.duration_ms;
                }
                self.speech_ms >= self.min_speech_ms && self.silence_ms >= self.silence_threshold_ms
            }
        }
    }

    /// Resets accumulated speech/silence, e.g. after a turn boundary has
    /// been consumed and the detector is ready for the next utterance.
    pub fn reset(&mut self) {
        self.speech_ms = 0;
        self.silence_ms = 0;
    }

    /// Feeds a whole frame sequence, returning `true` iff some prefix of
    /// it reached a turn boundary.
    pub fn detect(spec: &DuplexSpec, frames: &[AudioFrame]) -> bool {
        let mut detector = Self::new(spec);
        frames.iter().any(|f| detector.push(*f))
    }
}

/// Builds the frame sequence a selfplay persona's synthesized utterance
/// would produce over a duplex transport: one speech frame sized from the
/// utterance length, terminated the way each detection mode expects its
/// boundary — `Asm` via an immediate provider-native signal, `Vad` via a
/// trailing silence frame at the configured threshold. A `Vad` scenario
/// whose utterance is too short to clear `min_speech_ms` genuinely never
/// reaches a boundary, the same as a real session where the user didn't
/// speak long enough to count as a turn.
///
/// Roughly 60ms of speech per character is a crude but stable enough
/// estimate for driving the detector deterministically in the absence of
/// a real audio transport.
pub fn synthesize_utterance_frames(utterance_chars: usize, spec: &DuplexSpec) -> Vec<AudioFrame> {
    let speech_ms = utterance_chars as u64 * 60;
    match spec.turn_detection {
        TurnDetectionMode::Asm => vec![AudioFrame::speech(speech_ms).with_provider_boundary()],
        TurnDetectionMode::Vad => vec![AudioFrame::speech(speech_ms), AudioFrame::silence(spec.silence_threshold_ms)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: TurnDetectionMode, silence_threshold_ms: u64, min_speech_ms: u64) -> DuplexSpec {
        DuplexSpec {
            turn_detection: mode,
            silence_threshold_ms,
            min_speech_ms,
            inter_turn_delay_ms: 0,
            max_retries: 0,
            partial_success_min_turns: 0,
            ignore_last_turn_session_end: false,
            session_timeout_ms: None,
            tts_provider: None,
            selfplay_turns: None,
        }
    }

    #[test]
    fn vad_fires_once_speech_floor_and_silence_threshold_both_met() {
        let spec = spec(TurnDetectionMode::Vad, 600, 200);
        let mut d = TurnDetector::new(&spec);
        assert!(!d.push(AudioFrame::speech(250)));
        assert!(!d.push(AudioFrame::silence(300)));
        assert!(d.push(AudioFrame::silence(300))); // 300 + 300 = 600 >= threshold
    }

    #[test]
    fn vad_resets_silence_accumulator_on_renewed_speech() {
        let spec = spec(TurnDetectionMode::Vad, 600, 200);
        let mut d = TurnDetector::new(&spec);
        assert!(!d.push(AudioFrame::speech(250)));
        assert!(!d.push(AudioFrame::silence(500)));
        assert!(!d.push(AudioFrame::speech(50))); // user resumes before threshold trips
        assert!(!d.push(AudioFrame::silence(500)));
        assert!(d.push(AudioFrame::silence(100))); // now 500 + 100 = 600
    }

    #[test]
    fn vad_never_fires_if_speech_floor_is_not_met() {
        let spec = spec(TurnDetectionMode::Vad, 600, 200);
        let mut d = TurnDetector::new(&spec);
        assert!(!d.push(AudioFrame::speech(100))); // below min_speech_ms
        assert!(!d.push(AudioFrame::silence(1000)));
    }

    #[test]
    fn asm_ignores_timing_and_fires_only_on_provider_signal() {
        let spec = spec(TurnDetectionMode::Asm, 600, 200);
        let mut d = TurnDetector::new(&spec);
        assert!(!d.push(AudioFrame::speech(10_000)));
        assert!(!d.push(AudioFrame::silence(10_000)));
        assert!(d.push(AudioFrame::speech(1).with_provider_boundary()));
    }

    #[test]
    fn detect_helper_scans_a_full_frame_sequence() {
        let spec = spec(TurnDetectionMode::Vad, 600, 200);
        let frames = synthesize_utterance_frames(20, &spec);
        assert!(TurnDetector::detect(&spec, &frames));
    }

    #[test]
    fn synthesize_frames_asm_mode_closes_without_silence() {
        let spec = spec(TurnDetectionMode::Asm, 600, 200);
        let frames = synthesize_utterance_frames(5, &spec);
        assert_eq!(frames.len(), 1);
        assert!(TurnDetector::detect(&spec, &frames));
    }

    #[test]
    fn reset_clears_accumulated_speech_and_silence() {
        let spec = spec(TurnDetectionMode::Vad, 600, 200);
        let mut d = TurnDetector::new(&spec);
        d.push(AudioFrame::speech(250));
        d.push(AudioFrame::silence(300));
        d.reset();
        assert!(!d.push(AudioFrame::silence(300))); // silence alone after reset can't fire
    }
}
