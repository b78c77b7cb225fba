//! Capture-side voice gating.
//!
//! Re-windows live microphone samples, scores each window with a
//! [`VoiceActivityModel`] and runs a hysteresis state machine over the scores:
//!
//! ```text
//!            p >= pos                 N positive in a row
//!   Idle ─────────────▶ Candidate ─────────────────────────▶ Speaking
//!    ▲                      │ p < pos                           │ M windows p < neg
//!    │       Misfire        │                                   │
//!    └──────────────────────┴─────── SpeechEnd / Misfire ◀──────┘
//! ```

use crate::audio::activity::PlaybackActivity;
use crate::audio::denoise::{Denoiser, denoise_or_raw};
use crate::audio::pcm::{AudioFrame, SpeechSegment};
use crate::audio::vad::{EnergyModel, VoiceActivityModel};
use crate::defaults;
use std::collections::VecDeque;
use std::time::Instant;

/// Configuration for the capture gate.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per scored window.
    pub window_samples: usize,
    /// Probability a window must reach to count as speech.
    pub positive_threshold: f32,
    /// Probability under which a window counts as silence.
    pub negative_threshold: f32,
    /// Consecutive positive windows that confirm speech start.
    pub start_windows: u32,
    /// Consecutive negative windows that confirm speech end.
    pub redemption_windows: u32,
    /// Windows kept before speech and prepended to the segment.
    pub pre_roll_windows: usize,
    /// Positive windows a segment needs to be more than a misfire.
    pub min_speech_windows: u32,
    /// Segments longer than this are closed even without trailing silence.
    pub max_segment_windows: usize,
    /// Minimum RMS energy of a kept segment.
    pub energy_floor: f32,
    /// Floor multiplier while local playback is audible.
    pub echo_floor_multiplier: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            window_samples: defaults::VAD_WINDOW_SAMPLES,
            positive_threshold: defaults::POSITIVE_THRESHOLD,
            negative_threshold: defaults::NEGATIVE_THRESHOLD,
            start_windows: defaults::START_WINDOWS,
            redemption_windows: defaults::REDEMPTION_WINDOWS,
            pre_roll_windows: defaults::PRE_ROLL_WINDOWS,
            min_speech_windows: defaults::MIN_SPEECH_WINDOWS,
            max_segment_windows: defaults::MAX_SEGMENT_WINDOWS,
            energy_floor: defaults::ENERGY_FLOOR,
            echo_floor_multiplier: defaults::ECHO_FLOOR_MULTIPLIER,
        }
    }
}

/// Events emitted by the capture gate.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Speech confirmed; any in-flight response should be interrupted.
    SpeechStart,
    /// Speech ended and the segment passed the energy floor.
    SpeechEnd(SpeechSegment),
    /// A speech interval started but was never confirmed.
    Misfire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Candidate { run: u32 },
    Speaking { below: u32 },
}

/// Voice gate over a live sample stream.
pub struct CaptureGate {
    config: CaptureConfig,
    model: Box<dyn VoiceActivityModel>,
    denoiser: Option<Box<dyn Denoiser>>,
    activity: PlaybackActivity,
    state: GateState,
    partial: Vec<i16>,
    pre_roll: VecDeque<AudioFrame>,
    segment: Vec<AudioFrame>,
    positive_windows: u32,
    started_at: Option<Instant>,
}

impl CaptureGate {
    /// Creates a gate using the energy model.
    pub fn new(config: CaptureConfig) -> Self {
        Self::with_model(config, Box::new(EnergyModel::default()))
    }

    /// Creates a gate with a custom voice activity model.
    pub fn with_model(config: CaptureConfig, model: Box<dyn VoiceActivityModel>) -> Self {
        Self {
            config,
            model,
            denoiser: None,
            activity: PlaybackActivity::new(),
            state: GateState::Idle,
            partial: Vec::new(),
            pre_roll: VecDeque::new(),
            segment: Vec::new(),
            positive_windows: 0,
            started_at: None,
        }
    }

    /// Applies `denoiser` to accepted segments.
    pub fn with_denoiser(mut self, denoiser: Box<dyn Denoiser>) -> Self {
        self.denoiser = Some(denoiser);
        self
    }

    /// Shares the playback activity flag used to raise the energy floor.
    pub fn with_playback_activity(mut self, activity: PlaybackActivity) -> Self {
        self.activity = activity;
        self
    }

    /// True between a confirmed speech start and its end.
    pub fn is_speaking(&self) -> bool {
        matches!(self.state, GateState::Speaking { .. })
    }

    /// Energy floor currently in force.
    pub fn current_floor(&self) -> f32 {
        if self.activity.is_playing() {
            self.config.energy_floor * self.config.echo_floor_multiplier
        } else {
            self.config.energy_floor
        }
    }

    /// Feeds captured samples; returns the events they completed.
    pub fn on_samples(&mut self, frame: &AudioFrame) -> Vec<CaptureEvent> {
        self.partial.extend(frame.samples());

        let window_samples = self.config.window_samples.max(1);
        let mut events = Vec::new();
        while self.partial.len() >= window_samples {
            let window: Vec<i16> = self.partial.drain(..window_samples).collect();
            if let Some(event) = self.process_window(window) {
                events.push(event);
            }
        }
        events
    }

    /// Closes any open interval, e.g. when capture stops.
    pub fn flush(&mut self) -> Vec<CaptureEvent> {
        self.partial.clear();
        let event = match self.state {
            GateState::Idle => None,
            GateState::Candidate { .. } => Some(self.misfire()),
            GateState::Speaking { .. } => self.finish_segment(),
        };
        event.into_iter().collect()
    }

    /// Discards all state and returns to idle.
    pub fn reset(&mut self) {
        self.state = GateState::Idle;
        self.partial.clear();
        self.pre_roll.clear();
        self.segment.clear();
        self.positive_windows = 0;
        self.started_at = None;
        self.model.reset();
    }

    fn process_window(&mut self, window: Vec<i16>) -> Option<CaptureEvent> {
        let probability = self.model.speech_probability(&window);
        let frame = AudioFrame::from_samples(&window);
        let positive = probability >= self.config.positive_threshold;

        match self.state {
            GateState::Idle => {
                if !positive {
                    self.push_pre_roll(frame);
                    return None;
                }
                self.started_at = Some(Instant::now());
                self.segment = self.pre_roll.drain(..).collect();
                self.positive_windows = 0;
                self.advance_candidate(0, frame)
            }
            GateState::Candidate { run } => {
                if positive {
                    self.advance_candidate(run, frame)
                } else {
                    let event = self.misfire();
                    self.push_pre_roll(frame);
                    Some(event)
                }
            }
            GateState::Speaking { below } => {
                self.segment.push(frame);
                if positive {
                    self.positive_windows += 1;
                    self.state = GateState::Speaking { below: 0 };
                } else if probability < self.config.negative_threshold {
                    let below = below + 1;
                    if below >= self.config.redemption_windows {
                        return self.finish_segment();
                    }
                    self.state = GateState::Speaking { below };
                } else {
                    self.state = GateState::Speaking { below: 0 };
                }

                if self.segment.len() >= self.config.max_segment_windows {
                    tracing::debug!(
                        windows = self.segment.len(),
                        "Segment reached maximum length, closing"
                    );
                    return self.finish_segment();
                }
                None
            }
        }
    }

    fn advance_candidate(&mut self, run: u32, frame: AudioFrame) -> Option<CaptureEvent> {
        self.segment.push(frame);
        self.positive_windows += 1;
        let run = run + 1;
        if run >= self.config.start_windows {
            self.state = GateState::Speaking { below: 0 };
            tracing::debug!(windows = run, "Speech start confirmed");
            Some(CaptureEvent::SpeechStart)
        } else {
            self.state = GateState::Candidate { run };
            None
        }
    }

    fn push_pre_roll(&mut self, frame: AudioFrame) {
        if self.config.pre_roll_windows == 0 {
            return;
        }
        self.pre_roll.push_back(frame);
        while self.pre_roll.len() > self.config.pre_roll_windows {
            self.pre_roll.pop_front();
        }
    }

    /// Abandons the current interval, keeping its tail as pre-roll.
    fn misfire(&mut self) -> CaptureEvent {
        let frames = std::mem::take(&mut self.segment);
        self.state = GateState::Idle;
        self.positive_windows = 0;
        self.started_at = None;
        self.pre_roll.clear();
        for frame in frames {
            self.push_pre_roll(frame);
        }
        tracing::debug!("Speech misfire");
        CaptureEvent::Misfire
    }

    fn finish_segment(&mut self) -> Option<CaptureEvent> {
        let positive = self.positive_windows;
        if positive < self.config.min_speech_windows {
            return Some(self.misfire());
        }

        let frames = std::mem::take(&mut self.segment);
        let captured_at = self.started_at.take().unwrap_or_else(Instant::now);
        self.state = GateState::Idle;
        self.positive_windows = 0;

        let segment = SpeechSegment::new(frames, captured_at);
        let floor = self.current_floor();
        if segment.energy() < floor {
            tracing::debug!(
                energy = segment.energy(),
                floor,
                "Dropping low-energy segment"
            );
            return None;
        }

        let segment = match self.denoiser.as_deref() {
            Some(denoiser) => {
                let cleaned = denoise_or_raw(Some(denoiser), &segment.samples());
                SpeechSegment::from_frame(AudioFrame::from_samples(&cleaned), captured_at)
            }
            None => segment,
        };
        tracing::debug!(
            samples = segment.sample_count(),
            energy = segment.energy(),
            "Speech segment accepted"
        );
        Some(CaptureEvent::SpeechEnd(segment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::denoise::NoiseGateDenoiser;
    use crate::audio::vad::ScriptedModel;

    const WINDOW: usize = 16;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            window_samples: WINDOW,
            start_windows: 3,
            redemption_windows: 4,
            pre_roll_windows: 2,
            min_speech_windows: 4,
            energy_floor: 0.0,
            ..CaptureConfig::default()
        }
    }

    /// Gate whose model replays `script`, fed one window of loud samples per entry.
    fn run_script(config: CaptureConfig, script: &[f32]) -> (CaptureGate, Vec<CaptureEvent>) {
        let mut gate =
            CaptureGate::with_model(config, Box::new(ScriptedModel::new(script.to_vec())));
        let mut events = Vec::new();
        for _ in script {
            let frame = AudioFrame::from_samples(&[3000i16; WINDOW]);
            events.extend(gate.on_samples(&frame));
        }
        (gate, events)
    }

    fn speech_ends(events: &[CaptureEvent]) -> Vec<&SpeechSegment> {
        events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::SpeechEnd(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_requires_consecutive_positive_windows() {
        let (gate, events) = run_script(test_config(), &[0.9, 0.9]);
        assert!(events.is_empty());
        assert!(!gate.is_speaking());

        let (gate, events) = run_script(test_config(), &[0.9, 0.9, 0.9]);
        assert!(matches!(events.as_slice(), [CaptureEvent::SpeechStart]));
        assert!(gate.is_speaking());
    }

    #[test]
    fn test_broken_candidate_run_is_misfire() {
        let (gate, events) = run_script(test_config(), &[0.9, 0.9, 0.1, 0.0]);
        assert!(matches!(events.as_slice(), [CaptureEvent::Misfire]));
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_burst_shorter_than_min_speech_never_yields_segment() {
        // Confirmed after 3 windows but only 3 positive windows in total
        let mut script = vec![0.9, 0.9, 0.9];
        script.extend([0.1; 10]);
        let (_, events) = run_script(test_config(), &script);

        assert!(speech_ends(&events).is_empty());
        assert!(matches!(
            events.as_slice(),
            [CaptureEvent::SpeechStart, CaptureEvent::Misfire]
        ));
    }

    #[test]
    fn test_repeated_short_bursts_are_rejected_every_time() {
        let mut script = Vec::new();
        for _ in 0..5 {
            script.extend([0.9, 0.9]);
            script.extend([0.0; 6]);
        }
        let (_, events) = run_script(test_config(), &script);
        assert!(speech_ends(&events).is_empty());
        assert!(events.iter().all(|e| matches!(e, CaptureEvent::Misfire)));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_speech_end_after_redemption_windows() {
        let mut script = vec![0.1, 0.1, 0.1]; // pre-roll candidates
        script.extend([0.9; 6]);
        script.extend([0.1; 4]);
        let (gate, events) = run_script(test_config(), &script);

        let segments = speech_ends(&events);
        assert_eq!(segments.len(), 1);
        assert!(!gate.is_speaking());
        // 2 pre-roll + 6 speech + 4 redemption windows
        assert_eq!(segments[0].sample_count(), 12 * WINDOW);
    }

    #[test]
    fn test_windows_between_thresholds_hold_speech() {
        let mut script = vec![0.9; 5];
        // Between negative (0.45) and positive (0.65): resets the silence run
        script.extend([0.1, 0.1, 0.1, 0.5, 0.1, 0.1, 0.1]);
        let (gate, events) = run_script(test_config(), &script);
        assert!(speech_ends(&events).is_empty());
        assert!(gate.is_speaking());
    }

    #[test]
    fn test_partial_windows_are_buffered_across_calls() {
        let mut gate = CaptureGate::with_model(
            test_config(),
            Box::new(ScriptedModel::new([0.9, 0.9, 0.9])),
        );
        let half = AudioFrame::from_samples(&[3000i16; WINDOW / 2]);
        let mut events = Vec::new();
        for _ in 0..6 {
            events.extend(gate.on_samples(&half));
        }
        assert!(matches!(events.as_slice(), [CaptureEvent::SpeechStart]));
    }

    #[test]
    fn test_low_energy_segment_is_dropped_silently() {
        let config = CaptureConfig {
            energy_floor: 0.5,
            ..test_config()
        };
        let mut script = vec![0.9; 6];
        script.extend([0.1; 4]);
        let (_, events) = run_script(config, &script);
        assert!(matches!(events.as_slice(), [CaptureEvent::SpeechStart]));
    }

    #[test]
    fn test_floor_is_raised_while_playback_is_audible() {
        // Windows carry ±3000 (RMS ~0.09)
        let config = CaptureConfig {
            energy_floor: 0.05,
            echo_floor_multiplier: 3.0,
            ..test_config()
        };
        let mut script = vec![0.9; 6];
        script.extend([0.1; 4]);

        let (_, events) = run_script(config.clone(), &script);
        assert_eq!(speech_ends(&events).len(), 1);

        let activity = PlaybackActivity::new();
        activity.set_playing(true);
        let mut gate = CaptureGate::with_model(config, Box::new(ScriptedModel::new(script.clone())))
            .with_playback_activity(activity);
        assert!((gate.current_floor() - 0.15).abs() < 1e-6);
        let mut events = Vec::new();
        for _ in &script {
            events.extend(gate.on_samples(&AudioFrame::from_samples(&[3000i16; WINDOW])));
        }
        assert!(speech_ends(&events).is_empty());
    }

    #[test]
    fn test_flush_closes_open_speech() {
        let (mut gate, events) = run_script(test_config(), &[0.9; 6]);
        assert!(matches!(events.as_slice(), [CaptureEvent::SpeechStart]));

        let flushed = gate.flush();
        assert_eq!(speech_ends(&flushed).len(), 1);
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_max_segment_length_forces_end() {
        let config = CaptureConfig {
            max_segment_windows: 10,
            ..test_config()
        };
        let (gate, events) = run_script(config, &[0.9; 12]);
        assert_eq!(speech_ends(&events).len(), 1);
        assert!(!gate.is_speaking());
    }

    #[test]
    fn test_denoiser_is_applied_to_accepted_segments() {
        let mut script = vec![0.9; 6];
        script.extend([0.1; 4]);
        let mut gate =
            CaptureGate::with_model(test_config(), Box::new(ScriptedModel::new(script.clone())))
                .with_denoiser(Box::new(NoiseGateDenoiser::new(1.0, 0.0).with_frame_size(WINDOW)));
        let mut events = Vec::new();
        for _ in &script {
            events.extend(gate.on_samples(&AudioFrame::from_samples(&[3000i16; WINDOW])));
        }
        let segments = speech_ends(&events);
        assert_eq!(segments.len(), 1);
        // Gate level 1.0 silences everything
        assert!(segments[0].samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_energy_model_gate_on_real_levels() {
        let config = CaptureConfig {
            window_samples: 512,
            ..CaptureConfig::default()
        };
        let mut gate = CaptureGate::new(config);
        let silence = AudioFrame::from_samples(&[0i16; 512]);
        let tone: Vec<i16> = (0..512)
            .map(|i| if i % 2 == 0 { 4000 } else { -4000 })
            .collect();
        let speech = AudioFrame::from_samples(&tone);

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(gate.on_samples(&silence));
        }
        for _ in 0..10 {
            events.extend(gate.on_samples(&speech));
        }
        for _ in 0..10 {
            events.extend(gate.on_samples(&silence));
        }

        assert!(matches!(events.first(), Some(CaptureEvent::SpeechStart)));
        let segments = speech_ends(&events);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].energy() > defaults::ENERGY_FLOOR);
    }

    #[test]
    fn test_reset_discards_open_interval() {
        let (mut gate, _) = run_script(test_config(), &[0.9; 6]);
        assert!(gate.is_speaking());
        gate.reset();
        assert!(!gate.is_speaking());
        assert!(gate.flush().is_empty());
    }
}
