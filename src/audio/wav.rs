//! WAV file input and output.
//!
//! Input files of any rate and channel count are folded to 16 kHz mono so
//! that recorded utterances can stand in for the microphone.

use crate::audio::pcm::AudioFrame;
use crate::audio::source::AudioSource;
use crate::defaults::SAMPLE_RATE;
use crate::error::{ParleyError, Result};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;

/// 100 ms at 16 kHz.
const CHUNK_SAMPLES: usize = 1600;

/// Audio source that replays a WAV file in 100 ms chunks.
pub struct WavAudioSource {
    samples: Vec<i16>,
    position: usize,
    chunk_size: usize,
}

impl WavAudioSource {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to open WAV file {}: {}", path.display(), e),
        })?;
        Self::from_reader(Box::new(std::io::BufReader::new(file)))
    }

    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        let raw: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let mono = downmix(&raw, spec.channels as usize);
        let samples = resample(&mono, spec.sample_rate, SAMPLE_RATE);
        tracing::debug!(
            source_rate = spec.sample_rate,
            channels = spec.channels,
            samples = samples.len(),
            "Loaded WAV input"
        );

        Ok(Self {
            samples,
            position: 0,
            chunk_size: CHUNK_SAMPLES,
        })
    }

    /// Consumes the source into a single frame.
    pub fn into_frame(self) -> AudioFrame {
        AudioFrame::from_samples(&self.samples)
    }
}

impl AudioSource for WavAudioSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.position >= self.samples.len() {
            return Ok(Vec::new());
        }
        let end = (self.position + self.chunk_size).min(self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(chunk)
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Incremental 16 kHz mono WAV writer.
pub struct WavSink {
    writer: hound::WavWriter<BufWriter<File>>,
    samples_written: u64,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| ParleyError::AudioOutput {
            message: format!("Failed to create {}: {}", path.display(), e),
        })?;
        Ok(Self {
            writer,
            samples_written: 0,
        })
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        for &sample in samples {
            self.writer
                .write_sample(sample)
                .map_err(|e| ParleyError::AudioOutput {
                    message: format!("Failed to write WAV sample: {}", e),
                })?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Writes the header lengths and closes the file.
    pub fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .map_err(|e| ParleyError::AudioOutput {
                message: format!("Failed to finalize WAV file: {}", e),
            })
    }
}

fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear interpolation resampling.
pub(crate) fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let idx = source_pos.floor() as usize;
            let fraction = source_pos - idx as f64;

            if idx + 1 >= samples.len() {
                samples[idx.min(samples.len() - 1)]
            } else {
                let left = samples[idx] as f64;
                let right = samples[idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}
