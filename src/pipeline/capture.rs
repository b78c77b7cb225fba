//! Client-side capture: a reader thread pulls samples from an
//! [`AudioSource`] and a [`CaptureStation`] gates them into speech events.

use crate::audio::capture_gate::{CaptureEvent, CaptureGate};
use crate::audio::pcm::AudioFrame;
use crate::audio::source::AudioSource;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::error::{ErrorReporter, LogReporter, StationError};
use crate::pipeline::station::{Station, StationRunner};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Station wrapping the voice gate.
pub struct CaptureStation {
    gate: CaptureGate,
}

impl CaptureStation {
    pub fn new(gate: CaptureGate) -> Self {
        Self { gate }
    }
}

impl Station for CaptureStation {
    type Input = AudioFrame;
    type Output = CaptureEvent;

    fn process(
        &mut self,
        frame: AudioFrame,
        out: &mut Vec<CaptureEvent>,
    ) -> std::result::Result<(), StationError> {
        for event in self.gate.on_samples(&frame) {
            match &event {
                CaptureEvent::SpeechStart => tracing::debug!("Speech started"),
                CaptureEvent::SpeechEnd(segment) => tracing::debug!(
                    samples = segment.sample_count(),
                    energy = segment.energy(),
                    "Speech ended"
                ),
                CaptureEvent::Misfire => tracing::debug!("Speech misfire"),
            }
            out.push(event);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Capture"
    }

    fn finish(&mut self, out: &mut Vec<CaptureEvent>) {
        out.extend(self.gate.flush());
    }
}

#[derive(Debug, Clone)]
pub struct CapturePipelineConfig {
    /// Captured buffers queued for the gate. A live source drops buffers
    /// when the queue is full; a finite one waits.
    pub audio_buffer: usize,
    pub event_buffer: usize,
    /// Sleep between reads of a live source.
    pub poll_interval: Duration,
    /// Replay finite sources (files) at real-time speed.
    pub realtime_files: bool,
}

impl Default for CapturePipelineConfig {
    fn default() -> Self {
        Self {
            audio_buffer: 32,
            event_buffer: 16,
            poll_interval: Duration::from_millis(16),
            realtime_files: true,
        }
    }
}

pub struct CapturePipeline {
    config: CapturePipelineConfig,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl CapturePipeline {
    pub fn new(config: CapturePipelineConfig) -> Self {
        Self {
            config,
            error_reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Starts `source` and the gate. Events arrive on the handle's receiver,
    /// which disconnects once capture has stopped and the gate has flushed.
    pub fn start(self, mut source: Box<dyn AudioSource>, gate: CaptureGate) -> Result<CaptureHandle> {
        let (audio_tx, audio_rx) = bounded(self.config.audio_buffer.max(1));
        let (event_tx, event_rx) = bounded(self.config.event_buffer.max(1));

        source.start()?;
        let running = Arc::new(AtomicBool::new(true));
        let station = StationRunner::spawn(
            CaptureStation::new(gate),
            audio_rx,
            event_tx,
            Arc::clone(&self.error_reporter),
        );

        let reader_running = Arc::clone(&running);
        let reporter = Arc::clone(&self.error_reporter);
        let config = self.config.clone();
        let reader = thread::Builder::new()
            .name("capture-reader".to_string())
            .spawn(move || read_source(source, audio_tx, reader_running, reporter, config))
            .map_err(|e| ParleyError::AudioCapture {
                message: format!("Failed to spawn capture thread: {}", e),
            })?;

        Ok(CaptureHandle {
            running,
            reader: Some(reader),
            station: Some(station),
            events: Some(event_rx),
        })
    }
}

fn read_source(
    mut source: Box<dyn AudioSource>,
    audio_tx: Sender<AudioFrame>,
    running: Arc<AtomicBool>,
    reporter: Arc<dyn ErrorReporter>,
    config: CapturePipelineConfig,
) {
    let finite = source.is_finite();
    let mut dropped = 0u64;

    while running.load(Ordering::SeqCst) {
        let samples = match source.read_samples() {
            Ok(samples) => samples,
            Err(e) => {
                let error = StationError::from(e);
                reporter.report("CaptureReader", &error);
                if matches!(error, StationError::Fatal(_)) {
                    break;
                }
                thread::sleep(config.poll_interval);
                continue;
            }
        };

        if samples.is_empty() {
            if finite {
                tracing::debug!("Audio source exhausted");
                break;
            }
            thread::sleep(config.poll_interval);
            continue;
        }

        let frame = AudioFrame::from_samples(&samples);
        if finite {
            let duration = frame.duration(defaults::SAMPLE_RATE);
            if audio_tx.send(frame).is_err() {
                break;
            }
            if config.realtime_files {
                thread::sleep(duration);
            }
        } else {
            match audio_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::debug!(dropped, "Capture queue full, dropping buffer");
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
            thread::sleep(config.poll_interval);
        }
    }

    if let Err(e) = source.stop() {
        tracing::warn!(error = %e, "Failed to stop audio source");
    }
}

/// A running capture pipeline.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    station: Option<StationRunner<CaptureStation>>,
    events: Option<Receiver<CaptureEvent>>,
}

impl CaptureHandle {
    /// Takes the event receiver. Can only be taken once.
    pub fn take_events(&mut self) -> Option<Receiver<CaptureEvent>> {
        self.events.take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the source, flushes the gate and joins both threads.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            tracing::error!("Capture reader thread panicked");
        }
        // An unread receiver would keep the station blocked on send.
        self.events.take();
        if let Some(station) = self.station.take()
            && let Err(e) = station.join()
        {
            tracing::error!("{}", e);
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
