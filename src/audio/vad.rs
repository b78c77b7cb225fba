//! Voice activity models.
//!
//! A model turns one fixed-size window of samples into a speech probability.
//! The hysteresis that turns probabilities into speech intervals lives in
//! [`crate::audio::capture_gate`].

use crate::defaults;
use std::collections::VecDeque;

/// Per-window speech probability source.
pub trait VoiceActivityModel: Send {
    /// Returns the probability (0.0 to 1.0) that `window` contains speech.
    fn speech_probability(&mut self, window: &[i16]) -> f32;

    /// Clears any internal state carried between windows.
    fn reset(&mut self) {}
}

/// Energy-based model: window level in dBFS mapped through a logistic curve.
///
/// A window at `midpoint_db` scores 0.5; each `slope_db` above it multiplies
/// the odds of speech by e.
#[derive(Debug, Clone, Copy)]
pub struct EnergyModel {
    pub midpoint_db: f32,
    pub slope_db: f32,
}

impl Default for EnergyModel {
    fn default() -> Self {
        Self {
            midpoint_db: defaults::SPEECH_MIDPOINT_DB,
            slope_db: defaults::SPEECH_SLOPE_DB,
        }
    }
}

impl EnergyModel {
    pub fn new(midpoint_db: f32, slope_db: f32) -> Self {
        Self {
            midpoint_db,
            slope_db,
        }
    }
}

impl VoiceActivityModel for EnergyModel {
    fn speech_probability(&mut self, window: &[i16]) -> f32 {
        let db = rms_to_dbfs(calculate_rms(window));
        let slope = self.slope_db.max(f32::EPSILON);
        1.0 / (1.0 + (-(db - self.midpoint_db) / slope).exp())
    }
}

/// Model that replays a fixed list of probabilities, for tests and demos.
///
/// Once the script runs out it keeps returning the last value (or 0.0).
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    script: VecDeque<f32>,
    last: f32,
}

impl ScriptedModel {
    pub fn new(script: impl IntoIterator<Item = f32>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: 0.0,
        }
    }
}

impl VoiceActivityModel for ScriptedModel {
    fn speech_probability(&mut self, _window: &[i16]) -> f32 {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last
    }
}

/// Calculates the Root Mean Square (RMS) of audio samples.
///
/// # Returns
/// Normalized RMS value (0.0 to 1.0), where:
/// - 0.0 represents silence
/// - ~0.707 represents a full-scale sine wave
/// - 1.0 represents maximum amplitude
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}

/// Converts a normalized RMS level to dBFS, flooring silence at -120 dB.
pub fn rms_to_dbfs(rms: f32) -> f32 {
    if rms <= 1e-6 {
        -120.0
    } else {
        20.0 * rms.log10()
    }
}
