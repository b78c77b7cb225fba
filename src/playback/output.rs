//! Output backends for the playback scheduler.

use crate::audio::pcm::samples_to_duration;
use crate::error::{ParleyError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One buffer placed on the output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub id: u64,
    /// Start time on the output clock.
    pub start: Duration,
    /// Samples with the fade envelope already applied.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PlaybackItem {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    pub fn end(&self) -> Duration {
        self.start + self.duration()
    }
}

/// A sink that plays buffers at given times on its own monotonic clock.
pub trait AudioOutput: Send {
    /// Current position of the output clock.
    fn now(&self) -> Duration;

    /// Places `item` on the timeline.
    fn schedule(&mut self, item: PlaybackItem) -> Result<()>;

    /// Silences and forgets every scheduled item.
    fn halt(&mut self);
}

/// Applies a linear fade-in and, when the buffer is at least twice the fade
/// long, a matching fade-out.
pub fn apply_envelope(samples: &mut [i16], fade_samples: usize) {
    if fade_samples == 0 || samples.is_empty() {
        return;
    }

    let fade_in = fade_samples.min(samples.len());
    for (i, sample) in samples.iter_mut().take(fade_in).enumerate() {
        *sample = (*sample as f32 * (i as f32 / fade_samples as f32)) as i16;
    }

    if samples.len() >= fade_samples * 2 {
        let len = samples.len();
        for i in 0..fade_samples {
            let gain = i as f32 / fade_samples as f32;
            let idx = len - 1 - i;
            samples[idx] = (samples[idx] as f32 * gain) as i16;
        }
    }
}

/// Clock advanced by hand, for tests and offline rendering.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

/// Output that records what it is asked to play.
///
/// Clones share the clock and the record, so a test can keep one handle while
/// the scheduler owns another.
#[derive(Debug, Clone, Default)]
pub struct RecordingOutput {
    clock: ManualClock,
    scheduled: Arc<Mutex<Vec<PlaybackItem>>>,
    halts: Arc<AtomicU64>,
    fail_next: Arc<Mutex<bool>>,
}

impl RecordingOutput {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Every item scheduled so far, including halted ones.
    pub fn scheduled(&self) -> Vec<PlaybackItem> {
        self.scheduled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn halt_count(&self) -> u64 {
        self.halts.load(Ordering::SeqCst)
    }

    /// Makes the next `schedule` call fail.
    pub fn fail_next_schedule(&self) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }
}

impl AudioOutput for RecordingOutput {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn schedule(&mut self, item: PlaybackItem) -> Result<()> {
        let mut fail = self
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *fail {
            *fail = false;
            return Err(ParleyError::AudioOutput {
                message: "output rejected buffer".to_string(),
            });
        }
        self.scheduled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(item);
        Ok(())
    }

    fn halt(&mut self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_fades_both_ends_of_long_buffer() {
        let mut samples = vec![1000i16; 20];
        apply_envelope(&mut samples, 4);
        assert_eq!(&samples[..4], &[0, 250, 500, 750]);
        assert_eq!(&samples[4..16], &[1000; 12]);
        assert_eq!(&samples[16..], &[750, 500, 250, 0]);
    }

    #[test]
    fn test_envelope_short_buffer_gets_fade_in_only() {
        let mut samples = vec![1000i16; 6];
        apply_envelope(&mut samples, 4);
        assert_eq!(samples, vec![0, 250, 500, 750, 1000, 1000]);
    }

    #[test]
    fn test_zero_fade_is_noop() {
        let mut samples = vec![1000i16; 6];
        apply_envelope(&mut samples, 0);
        assert_eq!(samples, vec![1000; 6]);
    }

    #[test]
    fn test_item_timing() {
        let item = PlaybackItem {
            id: 1,
            start: Duration::from_millis(150),
            samples: vec![0; 1600],
            sample_rate: 16000,
        };
        assert_eq!(item.duration(), Duration::from_millis(100));
        assert_eq!(item.end(), Duration::from_millis(250));
    }

    #[test]
    fn test_recording_output_shares_state_between_clones() {
        let output = RecordingOutput::new(ManualClock::new());
        let mut handle = output.clone();

        output.clock().advance(Duration::from_millis(5));
        assert_eq!(handle.now(), Duration::from_millis(5));

        output.fail_next_schedule();
        let item = PlaybackItem {
            id: 0,
            start: Duration::ZERO,
            samples: vec![1],
            sample_rate: 16000,
        };
        assert!(handle.schedule(item.clone()).is_err());
        assert!(handle.schedule(item).is_ok());
        handle.halt();

        assert_eq!(output.scheduled().len(), 1);
        assert_eq!(output.halt_count(), 1);
    }
}
