//! Decides when accumulated response text is sent to the synthesizer.

use crate::defaults;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '…', '。', '！', '？'];

#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    /// Length at which the first chunk of a response is cut early.
    pub first_chunk_chars: usize,
    /// Shortest sentence worth synthesizing on its own.
    pub min_chunk_chars: usize,
    /// Hard ceiling for a single chunk.
    pub max_chunk_chars: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            first_chunk_chars: defaults::FIRST_CHUNK_CHARS,
            min_chunk_chars: defaults::MIN_CHUNK_CHARS,
            max_chunk_chars: defaults::MAX_CHUNK_CHARS,
        }
    }
}

/// Splits a stream of text deltas into synthesis-sized pieces.
///
/// A piece is cut at a sentence end, at the first-chunk length (so the first
/// audio starts early), or at the ceiling. Whatever is left is returned by
/// [`TextTrigger::finish`].
#[derive(Debug, Clone, Default)]
pub struct TextTrigger {
    config: TriggerConfig,
    pending: String,
    triggered: usize,
}

impl TextTrigger {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            pending: String::new(),
            triggered: 0,
        }
    }

    /// Appends a delta and returns every piece it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);
        let mut pieces = Vec::new();
        while let Some(cut) = self.next_cut() {
            if cut == 0 {
                break;
            }
            if let Some(piece) = self.take_until(cut) {
                pieces.push(piece);
            }
        }
        pieces
    }

    /// Returns the remaining text at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let len = self.pending.len();
        self.take_until(len)
    }

    /// Text accumulated but not yet triggered.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Number of pieces triggered so far.
    pub fn triggered(&self) -> usize {
        self.triggered
    }

    fn take_until(&mut self, byte_idx: usize) -> Option<String> {
        let rest = self.pending.split_off(byte_idx);
        let piece = std::mem::replace(&mut self.pending, rest.trim_start().to_string());
        let piece = piece.trim();
        if piece.is_empty() {
            return None;
        }
        self.triggered += 1;
        Some(piece.to_string())
    }

    fn next_cut(&self) -> Option<usize> {
        if let Some(cut) = self.sentence_cut() {
            return Some(cut);
        }

        let chars = self.pending.chars().count();
        if self.triggered == 0
            && chars >= self.config.first_chunk_chars
            && let Some(cut) = last_whitespace(&self.pending)
        {
            return Some(cut);
        }

        if chars >= self.config.max_chunk_chars {
            let ceiling = self
                .pending
                .char_indices()
                .nth(self.config.max_chunk_chars)
                .map(|(i, _)| i)
                .unwrap_or(self.pending.len());
            return Some(last_whitespace(&self.pending[..ceiling]).unwrap_or(ceiling));
        }
        None
    }

    /// First sentence end (terminator + whitespace) long enough to stand alone.
    fn sentence_cut(&self) -> Option<usize> {
        let mut chars = self.pending.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !SENTENCE_TERMINATORS.contains(&c) {
                continue;
            }
            let Some(&(next_idx, next)) = chars.peek() else {
                break;
            };
            if !next.is_whitespace() {
                continue;
            }
            let end = i + c.len_utf8();
            if self.pending[..end].trim().chars().count() >= self.config.min_chunk_chars {
                return Some(next_idx);
            }
        }
        None
    }
}

/// Byte index of the last whitespace with text before it.
fn last_whitespace(text: &str) -> Option<usize> {
    text.char_indices()
        .rev()
        .find(|(i, c)| c.is_whitespace() && !text[..*i].trim().is_empty())
        .map(|(i, _)| i)
}
