//! Microphone capture using CPAL.

use crate::audio::source::AudioSource;
use crate::audio::wav::resample;
use crate::defaults;
use crate::error::{ParleyError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Device name fragments preferred on desktop Linux.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse"];

/// Device name fragments that are never voice inputs.
const FILTERED_PATTERNS: &[&str] = &[
    "surround", "front:", "rear:", "center:", "side:", "hdmi", "s/pdif",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS.iter().any(|p| lower.contains(p))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES.iter().any(|p| lower.contains(p))
}

/// Lists usable input devices, marking preferred ones.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to enumerate input devices: {}", e),
        })?;

    let mut names = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        if should_filter_device(&name) {
            continue;
        }
        if is_preferred_device(&name) {
            names.push(format!("{} [recommended]", name));
        } else {
            names.push(name);
        }
    }
    Ok(names)
}

fn find_input_device(device_name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to enumerate devices: {}", e),
        })?;

    let mut preferred = None;
    for device in devices {
        let Ok(name) = device.name() else { continue };
        match device_name {
            Some(wanted) if name == wanted => return Ok(device),
            None if preferred.is_none() && is_preferred_device(&name) => {
                preferred = Some(device);
            }
            _ => {}
        }
    }

    if let Some(wanted) = device_name {
        return Err(ParleyError::AudioDeviceNotFound {
            device: wanted.to_string(),
        });
    }
    preferred
        .or_else(|| host.default_input_device())
        .ok_or_else(|| ParleyError::AudioDeviceNotFound {
            device: "default".to_string(),
        })
}

/// Holds the stream so the source can move between threads.
///
/// SAFETY: the stream is only touched through the owning `CpalAudioSource`,
/// which is used from one thread at a time.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture at 16 kHz mono.
///
/// Asks the device for i16/16 kHz/mono first, then falls back to the device's
/// native format with software downmix and resampling.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callbacks: Arc<AtomicU64>,
}

impl CpalAudioSource {
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_input_device(device_name)?;
        if let Ok(name) = device.name() {
            tracing::info!(device = %name, "Using input device");
        }
        Ok(Self {
            device,
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            callbacks: Arc::new(AtomicU64::new(0)),
        })
    }

    fn build_preferred_stream(&self) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(defaults::SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let buffer = Arc::clone(&self.buffer);
        let callbacks = Arc::clone(&self.callbacks);
        self.device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    callbacks.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| tracing::error!(error = %err, "Audio input stream error"),
                None,
            )
            .map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to build input stream: {}", e),
            })
    }

    fn build_native_stream(&self) -> Result<cpal::Stream> {
        let native = self
            .device
            .default_input_config()
            .map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to query default input config: {}", e),
            })?;
        let rate = native.sample_rate().0;
        let channels = native.channels() as usize;
        tracing::info!(
            channels,
            rate,
            format = ?native.sample_format(),
            "Using native input format, converting in software"
        );

        let buffer = Arc::clone(&self.buffer);
        let callbacks = Arc::clone(&self.callbacks);
        let config: cpal::StreamConfig = native.clone().into();
        let push = move |samples: Vec<i16>| {
            callbacks.fetch_add(1, Ordering::Relaxed);
            let mono = downmix(&samples, channels);
            let converted = resample(&mono, rate, defaults::SAMPLE_RATE);
            if let Ok(mut buf) = buffer.lock() {
                buf.extend_from_slice(&converted);
            }
        };

        let result = match native.sample_format() {
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| push(data.to_vec()),
                |err| tracing::error!(error = %err, "Audio input stream error"),
                None,
            ),
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect(),
                    )
                },
                |err| tracing::error!(error = %err, "Audio input stream error"),
                None,
            ),
            other => {
                return Err(ParleyError::AudioCapture {
                    message: format!("Unsupported native sample format: {:?}", other),
                });
            }
        };
        result.map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to build native input stream: {}", e),
        })
    }
}

fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
        .collect()
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = match self.build_preferred_stream() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(error = %e, "Preferred input format rejected");
                self.build_native_stream()?
            }
        };
        stream.play().map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        // Some PipeWire-ALSA setups accept the preferred config but never call back
        std::thread::sleep(std::time::Duration::from_millis(200));
        let stream = if self.callbacks.load(Ordering::Relaxed) == 0 {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            let native = self.build_native_stream()?;
            native.play().map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to start native audio stream: {}", e),
            })?;
            native
        } else {
            stream
        };

        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| ParleyError::AudioCapture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }
}
