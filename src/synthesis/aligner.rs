//! Sample alignment and fixed-size chunking of synthesized PCM.
//!
//! Providers deliver byte fragments of arbitrary length. [`SampleAligner`]
//! holds back a trailing partial sample until the next fragment completes it;
//! [`ChunkAssembler`] slices the aligned bytes into equal output chunks.

use crate::audio::pcm::AudioFrame;

#[derive(Debug, Clone)]
pub struct SampleAligner {
    sample_width: usize,
    carry: Vec<u8>,
}

impl SampleAligner {
    pub fn new(sample_width: usize) -> Self {
        Self {
            sample_width: sample_width.max(1),
            carry: Vec::with_capacity(sample_width),
        }
    }

    /// Prefixes the carryover, returns the whole samples and keeps the rest.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<u8> {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(fragment);
        let partial = bytes.len() % self.sample_width;
        if partial > 0 {
            self.carry = bytes.split_off(bytes.len() - partial);
        }
        bytes
    }

    /// Bytes currently held back.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Discards the carryover, returning how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.carry.len();
        self.carry.clear();
        dropped
    }
}

#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    chunk_bytes: usize,
    sample_width: usize,
    buffer: Vec<u8>,
}

impl ChunkAssembler {
    /// `chunk_bytes` is rounded down to a whole number of samples.
    pub fn new(chunk_bytes: usize, sample_width: usize) -> Self {
        let sample_width = sample_width.max(1);
        let chunk_bytes = (chunk_bytes / sample_width).max(1) * sample_width;
        Self {
            chunk_bytes,
            sample_width,
            buffer: Vec::with_capacity(chunk_bytes),
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends aligned bytes and returns every full chunk now available.
    pub fn push(&mut self, aligned: &[u8]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(aligned);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_bytes {
            let rest = self.buffer.split_off(self.chunk_bytes);
            let chunk = std::mem::replace(&mut self.buffer, rest);
            chunks.push(AudioFrame::from_aligned(chunk));
        }
        chunks
    }

    /// Emits the remaining whole samples as a final, possibly short chunk.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        let whole = self.buffer.len() - self.buffer.len() % self.sample_width;
        let mut remaining = std::mem::take(&mut self.buffer);
        remaining.truncate(whole);
        if remaining.is_empty() {
            None
        } else {
            Some(AudioFrame::from_aligned(remaining))
        }
    }

    /// Drops everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
