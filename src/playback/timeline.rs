//! Sample timeline mixer.
//!
//! The number of samples rendered so far is the output clock, so scheduling
//! against it is exact. A device callback or the real-time render thread pulls
//! samples out of it.

use crate::audio::pcm::{duration_to_samples, samples_to_duration};
use crate::audio::wav::WavSink;
use crate::error::{ParleyError, Result};
use crate::playback::output::{AudioOutput, PlaybackItem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Placed {
    start_sample: u64,
    samples: Vec<i16>,
}

impl Placed {
    fn end_sample(&self) -> u64 {
        self.start_sample + self.samples.len() as u64
    }
}

#[derive(Debug)]
pub struct Timeline {
    sample_rate: u32,
    rendered: u64,
    items: Vec<Placed>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            rendered: 0,
            items: Vec::new(),
        }
    }

    pub fn now(&self) -> Duration {
        samples_to_duration(self.rendered, self.sample_rate)
    }

    pub fn rendered_samples(&self) -> u64 {
        self.rendered
    }

    pub fn pending_items(&self) -> usize {
        self.items.len()
    }

    pub fn place(&mut self, item: PlaybackItem) {
        let start_sample = duration_to_samples(item.start, self.sample_rate);
        self.items.push(Placed {
            start_sample,
            samples: item.samples,
        });
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Mixes the next `out.len()` samples into `out` and advances the clock.
    pub fn render(&mut self, out: &mut [i16]) {
        out.fill(0);
        let from = self.rendered;
        let to = from + out.len() as u64;

        for item in &self.items {
            if item.end_sample() <= from || item.start_sample >= to {
                continue;
            }
            let first = item.start_sample.max(from);
            let last = item.end_sample().min(to);
            for pos in first..last {
                let out_idx = (pos - from) as usize;
                let item_idx = (pos - item.start_sample) as usize;
                out[out_idx] = out[out_idx].saturating_add(item.samples[item_idx]);
            }
        }

        self.rendered = to;
        self.items.retain(|item| item.end_sample() > to);
    }
}

/// [`AudioOutput`] backed by a shared [`Timeline`].
#[derive(Debug, Clone)]
pub struct TimelineOutput {
    timeline: Arc<Mutex<Timeline>>,
}

impl TimelineOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline::new(sample_rate))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Timeline> {
        self.timeline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Renders into `out`; called by whatever drives the clock.
    pub fn render(&self, out: &mut [i16]) {
        self.lock().render(out);
    }

    pub fn pending_items(&self) -> usize {
        self.lock().pending_items()
    }
}

impl AudioOutput for TimelineOutput {
    fn now(&self) -> Duration {
        self.lock().now()
    }

    fn schedule(&mut self, item: PlaybackItem) -> Result<()> {
        self.lock().place(item);
        Ok(())
    }

    fn halt(&mut self) {
        self.lock().clear();
    }
}

/// Drives a [`TimelineOutput`] in real time from a background thread,
/// optionally writing everything rendered to a WAV file.
pub struct RealtimeRenderer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl RealtimeRenderer {
    pub fn spawn(
        output: TimelineOutput,
        sample_rate: u32,
        period: Duration,
        mut sink: Option<WavSink>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name("playback-render".to_string())
            .spawn(move || -> Result<u64> {
                let started = Instant::now();
                let mut rendered: u64 = 0;
                let mut buffer = Vec::new();

                while flag.load(Ordering::SeqCst) {
                    std::thread::sleep(period);
                    let due = duration_to_samples(started.elapsed(), sample_rate);
                    if due <= rendered {
                        continue;
                    }
                    buffer.resize((due - rendered) as usize, 0);
                    output.render(&mut buffer);
                    rendered = due;
                    if let Some(sink) = sink.as_mut() {
                        sink.write_samples(&buffer)?;
                    }
                }

                if let Some(sink) = sink {
                    sink.finalize()?;
                }
                Ok(rendered)
            })
            .map_err(|e| ParleyError::AudioOutput {
                message: format!("Failed to spawn render thread: {}", e),
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stops the thread, finalizes the sink and returns the samples rendered.
    pub fn stop(mut self) -> Result<u64> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64> {
        self.running.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ParleyError::AudioOutput {
                message: "render thread panicked".to_string(),
            })?,
            None => Ok(0),
        }
    }
}

impl Drop for RealtimeRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Render thread stopped with error");
        }
    }
}
