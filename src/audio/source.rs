use crate::error::{ParleyError, Result};
use std::collections::VecDeque;

/// Something that produces captured 16 kHz mono samples.
///
/// Implemented by the microphone (cpal), WAV files and the test mock.
pub trait AudioSource: Send {
    /// Starts capturing.
    fn start(&mut self) -> Result<()>;

    /// Stops capturing.
    fn stop(&mut self) -> Result<()>;

    /// Returns the samples captured since the last call (possibly none).
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Finite sources end once `read_samples` returns an empty buffer.
    fn is_finite(&self) -> bool {
        false
    }
}

/// Mock audio source for testing.
///
/// Replays a queue of chunks; once they are used up it either repeats silence
/// (live mode) or reports end of input (finite mode).
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    chunks: VecDeque<Vec<i16>>,
    silence_len: usize,
    finite: bool,
    is_started: bool,
    fail_start: bool,
    fail_read: bool,
}

impl MockAudioSource {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            silence_len: 160,
            finite: false,
            is_started: false,
            fail_start: false,
            fail_read: false,
        }
    }

    /// Queues one chunk to be returned by a later `read_samples` call.
    pub fn with_chunk(mut self, samples: Vec<i16>) -> Self {
        self.chunks.push_back(samples);
        self
    }

    /// Queues `count` copies of `samples`.
    pub fn with_repeated(mut self, samples: Vec<i16>, count: usize) -> Self {
        for _ in 0..count {
            self.chunks.push_back(samples.clone());
        }
        self
    }

    /// Ends input after the queued chunks instead of returning silence.
    pub fn finite(mut self) -> Self {
        self.finite = true;
        self
    }

    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_read_failure(mut self) -> Self {
        self.fail_read = true;
        self
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    pub fn remaining_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.fail_start {
            return Err(ParleyError::AudioCapture {
                message: "mock audio error".to_string(),
            });
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.fail_read {
            return Err(ParleyError::AudioCapture {
                message: "mock audio error".to_string(),
            });
        }
        match self.chunks.pop_front() {
            Some(chunk) => Ok(chunk),
            None if self.finite => Ok(Vec::new()),
            None => Ok(vec![0i16; self.silence_len]),
        }
    }

    fn is_finite(&self) -> bool {
        self.finite
    }
}
