//! Speaker output using CPAL.
//!
//! The device callback pulls from a [`TimelineOutput`], so the device's own
//! sample counter becomes the scheduler's clock.

use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::playback::timeline::TimelineOutput;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

/// SAFETY: the stream is only touched through the owning `CpalOutput`.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

pub struct CpalOutput {
    stream: SendableStream,
}

impl CpalOutput {
    /// Opens the output device at 16 kHz and starts pulling from `timeline`.
    pub fn start(timeline: TimelineOutput, device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(wanted) => host
                .output_devices()
                .map_err(|e| ParleyError::AudioOutput {
                    message: format!("Failed to enumerate output devices: {}", e),
                })?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| ParleyError::AudioDeviceNotFound {
                    device: wanted.to_string(),
                })?,
            None => host
                .default_output_device()
                .ok_or_else(|| ParleyError::AudioDeviceNotFound {
                    device: "default".to_string(),
                })?,
        };

        let native = device
            .default_output_config()
            .map_err(|e| ParleyError::AudioOutput {
                message: format!("Failed to query default output config: {}", e),
            })?;
        let channels = native.channels() as usize;
        let config = cpal::StreamConfig {
            channels: native.channels(),
            sample_rate: cpal::SampleRate(defaults::SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut mono = Vec::new();
        let stream = match native.sample_format() {
            cpal::SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels.max(1), 0);
                    timeline.render(&mut mono);
                    for (frame, &sample) in data.chunks_mut(channels.max(1)).zip(&mono) {
                        frame.fill(sample);
                    }
                },
                |err| tracing::error!(error = %err, "Audio output stream error"),
                None,
            ),
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mono.resize(data.len() / channels.max(1), 0);
                    timeline.render(&mut mono);
                    for (frame, &sample) in data.chunks_mut(channels.max(1)).zip(&mono) {
                        frame.fill(sample as f32 / i16::MAX as f32);
                    }
                },
                |err| tracing::error!(error = %err, "Audio output stream error"),
                None,
            ),
            other => {
                return Err(ParleyError::AudioOutput {
                    message: format!("Unsupported output sample format: {:?}", other),
                });
            }
        }
        .map_err(|e| ParleyError::AudioOutput {
            message: format!("Failed to build output stream at 16 kHz: {}", e),
        })?;

        stream.play().map_err(|e| ParleyError::AudioOutput {
            message: format!("Failed to start output stream: {}", e),
        })?;
        if let Ok(name) = device.name() {
            tracing::info!(device = %name, channels, "Audio output started");
        }

        Ok(Self {
            stream: SendableStream(stream),
        })
    }

    pub fn stop(self) -> Result<()> {
        self.stream.0.pause().map_err(|e| ParleyError::AudioOutput {
            message: format!("Failed to stop output stream: {}", e),
        })
    }
}
