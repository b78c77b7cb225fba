//! Optional denoising pass for accepted speech segments.
//!
//! Denoising is best-effort: any failure falls back to the raw samples.

use crate::audio::vad::calculate_rms;
use crate::defaults;
use crate::error::{ParleyError, Result};

/// Frame-based denoiser.
pub trait Denoiser: Send + Sync {
    /// Samples per processed frame.
    fn frame_size(&self) -> usize;

    /// Denoises one frame in place. The last frame of a segment is zero-padded
    /// to `frame_size`.
    fn process_frame(&self, frame: &mut [i16]) -> Result<()>;

    fn name(&self) -> &str;
}

/// Attenuates frames whose level stays under a gate.
#[derive(Debug, Clone)]
pub struct NoiseGateDenoiser {
    /// RMS level (0.0 to 1.0) under which a frame is treated as noise.
    pub gate_level: f32,
    /// Gain applied to gated frames.
    pub attenuation: f32,
    frame_size: usize,
}

impl Default for NoiseGateDenoiser {
    fn default() -> Self {
        Self {
            gate_level: 0.01,
            attenuation: 0.1,
            frame_size: defaults::DENOISE_FRAME_SAMPLES,
        }
    }
}

impl NoiseGateDenoiser {
    pub fn new(gate_level: f32, attenuation: f32) -> Self {
        Self {
            gate_level,
            attenuation,
            ..Self::default()
        }
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }
}

impl Denoiser for NoiseGateDenoiser {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn process_frame(&self, frame: &mut [i16]) -> Result<()> {
        if calculate_rms(frame) >= self.gate_level {
            return Ok(());
        }
        for sample in frame.iter_mut() {
            *sample = (*sample as f32 * self.attenuation) as i16;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "noise-gate"
    }
}

/// Runs `denoiser` over `samples`, returning the raw samples when no denoiser
/// is configured or when it fails.
pub fn denoise_or_raw(denoiser: Option<&dyn Denoiser>, samples: &[i16]) -> Vec<i16> {
    let Some(denoiser) = denoiser else {
        return samples.to_vec();
    };
    match denoise(denoiser, samples) {
        Ok(cleaned) => cleaned,
        Err(e) => {
            tracing::warn!(denoiser = denoiser.name(), error = %e, "Denoising failed, using raw audio");
            samples.to_vec()
        }
    }
}

fn denoise(denoiser: &dyn Denoiser, samples: &[i16]) -> Result<Vec<i16>> {
    let frame_size = denoiser.frame_size();
    if frame_size == 0 {
        return Err(ParleyError::Denoise {
            message: "frame size must be positive".to_string(),
        });
    }

    let mut out = Vec::with_capacity(samples.len());
    let mut frame = vec![0i16; frame_size];
    for chunk in samples.chunks(frame_size) {
        frame[..chunk.len()].copy_from_slice(chunk);
        frame[chunk.len()..].fill(0);
        denoiser.process_frame(&mut frame)?;
        out.extend_from_slice(&frame[..chunk.len()]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDenoiser;

    impl Denoiser for FailingDenoiser {
        fn frame_size(&self) -> usize {
            480
        }

        fn process_frame(&self, _frame: &mut [i16]) -> Result<()> {
            Err(ParleyError::Denoise {
                message: "model not loaded".to_string(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_no_denoiser_returns_raw() {
        let samples = vec![5i16; 100];
        assert_eq!(denoise_or_raw(None, &samples), samples);
    }

    #[test]
    fn test_failing_denoiser_falls_back_to_raw() {
        let samples = vec![5i16; 1000];
        let out = denoise_or_raw(Some(&FailingDenoiser), &samples);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_zero_frame_size_falls_back_to_raw() {
        let denoiser = NoiseGateDenoiser::default().with_frame_size(0);
        let samples = vec![5i16; 10];
        assert_eq!(denoise_or_raw(Some(&denoiser), &samples), samples);
    }

    #[test]
    fn test_noise_gate_attenuates_quiet_frames_only() {
        let denoiser = NoiseGateDenoiser::new(0.01, 0.0).with_frame_size(4);
        // First frame quiet (10/32767), second frame loud
        let samples = vec![10, -10, 10, -10, 5000, -5000, 5000, -5000];
        let out = denoise_or_raw(Some(&denoiser), &samples);
        assert_eq!(out, vec![0, 0, 0, 0, 5000, -5000, 5000, -5000]);
    }

    #[test]
    fn test_output_length_matches_input_with_partial_last_frame() {
        let denoiser = NoiseGateDenoiser::default();
        let samples = vec![0i16; 1000]; // 2 full frames + 40
        let out = denoise_or_raw(Some(&denoiser), &samples);
        assert_eq!(out.len(), 1000);
    }
}
