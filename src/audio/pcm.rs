//! PCM data model shared by every stage.
//!
//! All audio in the pipeline is signed 16-bit little-endian mono at
//! [`defaults::SAMPLE_RATE`]. An [`AudioFrame`] always holds a whole number of
//! samples; the constructors enforce it.

use crate::audio::vad::calculate_rms;
use crate::defaults;
use crate::error::{ParleyError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::time::{Duration, Instant};

/// A contiguous run of 16-bit little-endian PCM samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
}

impl AudioFrame {
    /// Wraps raw little-endian bytes, rejecting a trailing partial sample.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() % defaults::SAMPLE_WIDTH != 0 {
            return Err(ParleyError::MisalignedPcm { len: data.len() });
        }
        Ok(Self { data })
    }

    /// Wraps bytes the caller has already cut on a sample boundary.
    pub(crate) fn from_aligned(data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len() % defaults::SAMPLE_WIDTH, 0);
        Self { data }
    }

    /// Encodes samples as little-endian bytes.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut data = Vec::with_capacity(samples.len() * defaults::SAMPLE_WIDTH);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self { data }
    }

    /// Decodes base64 text (as carried by `audio-chunk` messages).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| ParleyError::Protocol {
                message: format!("Invalid base64 audio: {}", e),
            })?;
        Self::from_bytes(data)
    }

    /// Encodes the frame as base64 text.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// Concatenates frames in order.
    pub fn concat<'a>(frames: impl IntoIterator<Item = &'a AudioFrame>) -> Self {
        let mut data = Vec::new();
        for frame in frames {
            data.extend_from_slice(&frame.data);
        }
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / defaults::SAMPLE_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decodes the frame into samples.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(defaults::SAMPLE_WIDTH)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Playback duration at the given sample rate.
    ///
    /// Computed in whole nanoseconds so that summing frame durations is exact
    /// for rates that divide 10^9 (8, 16, 32, 48 kHz... all but 44.1 kHz).
    pub fn duration(&self, sample_rate: u32) -> Duration {
        samples_to_duration(self.sample_count() as u64, sample_rate)
    }
}

/// Converts a sample count to a duration at `sample_rate`.
pub fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = (samples as u128 * 1_000_000_000u128) / sample_rate as u128;
    Duration::from_nanos(nanos as u64)
}

/// Converts a duration to the number of whole samples it spans.
pub fn duration_to_samples(duration: Duration, sample_rate: u32) -> u64 {
    ((duration.as_nanos() * sample_rate as u128) / 1_000_000_000u128) as u64
}

/// A finished stretch of user speech.
///
/// Immutable once built; handed to the transcription collaborator by value.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    frames: Vec<AudioFrame>,
    captured_at: Instant,
    energy: f32,
}

impl SpeechSegment {
    /// Builds a segment and computes its RMS energy.
    pub fn new(frames: Vec<AudioFrame>, captured_at: Instant) -> Self {
        let samples: Vec<i16> = frames.iter().flat_map(|f| f.samples()).collect();
        let energy = calculate_rms(&samples);
        Self {
            frames,
            captured_at,
            energy,
        }
    }

    /// Builds a single-frame segment (e.g. a received binary message).
    pub fn from_frame(frame: AudioFrame, captured_at: Instant) -> Self {
        Self::new(vec![frame], captured_at)
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// RMS energy of the whole segment (0.0 to 1.0).
    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(AudioFrame::sample_count).sum()
    }

    pub fn duration(&self, sample_rate: u32) -> Duration {
        samples_to_duration(self.sample_count() as u64, sample_rate)
    }

    /// All samples in order.
    pub fn samples(&self) -> Vec<i16> {
        self.frames.iter().flat_map(|f| f.samples()).collect()
    }

    /// Consumes the segment into one contiguous frame.
    pub fn into_frame(self) -> AudioFrame {
        AudioFrame::concat(&self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_rejects_odd_length() {
        let result = AudioFrame::from_bytes(vec![1, 2, 3]);
        assert!(matches!(result, Err(ParleyError::MisalignedPcm { len: 3 })));
    }

    #[test]
    fn test_samples_round_trip_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2, i16::MAX, i16::MIN]);
        assert_eq!(frame.as_bytes()[..4], [0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(frame.samples(), vec![1, -2, i16::MAX, i16::MIN]);
        assert_eq!(frame.sample_count(), 4);
        assert_eq!(frame.byte_len(), 8);
    }

    #[test]
    fn test_duration_is_exact_at_16khz() {
        let frame = AudioFrame::from_samples(&vec![0i16; 8192]);
        assert_eq!(frame.duration(16000), Duration::from_millis(512));

        let one_sample = AudioFrame::from_samples(&[0]);
        assert_eq!(one_sample.duration(16000), Duration::from_nanos(62_500));
    }

    #[test]
    fn test_duration_sample_conversion_inverse() {
        let d = samples_to_duration(2400, 16000);
        assert_eq!(d, Duration::from_millis(150));
        assert_eq!(duration_to_samples(d, 16000), 2400);
        assert_eq!(duration_to_samples(Duration::from_millis(5), 16000), 80);
    }

    #[test]
    fn test_base64_round_trip() {
        let frame = AudioFrame::from_samples(&[100, -100, 0]);
        let decoded = AudioFrame::from_base64(&frame.to_base64()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_from_base64_rejects_garbage_and_odd_payloads() {
        assert!(AudioFrame::from_base64("%%%not base64").is_err());
        // "AQID" decodes to three bytes
        assert!(matches!(
            AudioFrame::from_base64("AQID"),
            Err(ParleyError::MisalignedPcm { len: 3 })
        ));
    }

    #[test]
    fn test_concat_preserves_order() {
        let a = AudioFrame::from_samples(&[1, 2]);
        let b = AudioFrame::from_samples(&[3]);
        assert_eq!(AudioFrame::concat([&a, &b]).samples(), vec![1, 2, 3]);
    }

    #[test]
    fn test_segment_energy_and_consumption() {
        let loud = AudioFrame::from_samples(&vec![i16::MAX; 100]);
        let silent = AudioFrame::from_samples(&vec![0; 100]);
        let segment = SpeechSegment::new(vec![loud, silent], Instant::now());

        assert_eq!(segment.sample_count(), 200);
        // Half full-scale, half silence: sqrt(0.5)
        assert!((segment.energy() - 0.7071).abs() < 0.01);

        let frame = segment.into_frame();
        assert_eq!(frame.sample_count(), 200);
    }
}
