use crate::defaults;
use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Text-to-speech backend producing 16-bit mono PCM at 16 kHz.
///
/// Fragments may have any length, including odd ones; alignment is the
/// caller's job.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesizes a whole utterance.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Synthesizes `text` as a stream of fragments.
    ///
    /// The default wraps [`SynthesisProvider::synthesize`] in a one-item
    /// stream. Implementations that can stream should stop producing once
    /// `cancel` fires.
    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        if cancel.is_cancelled() {
            return Ok(stream::empty().boxed());
        }
        let audio = self.synthesize(text).await?;
        Ok(stream::once(async move { Ok(audio) }).boxed())
    }
}

#[async_trait]
impl<T: SynthesisProvider + ?Sized> SynthesisProvider for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        (**self).synthesize(text).await
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        (**self).synthesize_stream(text, cancel).await
    }
}

/// Offline synthesizer rendering a sine tone whose length follows the text.
///
/// Streams in deliberately odd-sized fragments, which keeps the alignment path
/// exercised end to end.
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    pub frequency: f32,
    pub amplitude: f32,
    pub ms_per_char: u32,
    pub fragment_bytes: usize,
    /// Delay between streamed fragments.
    pub pace: Option<Duration>,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 0.2,
            ms_per_char: 40,
            fragment_bytes: 4095,
            pace: None,
        }
    }
}

impl ToneSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn with_fragment_bytes(mut self, fragment_bytes: usize) -> Self {
        self.fragment_bytes = fragment_bytes.max(1);
        self
    }

    fn render(&self, text: &str) -> Vec<u8> {
        let chars = text.chars().filter(|c| !c.is_whitespace()).count() as u64;
        let samples = chars * self.ms_per_char as u64 * defaults::SAMPLE_RATE as u64 / 1000;
        let step = std::f32::consts::TAU * self.frequency / defaults::SAMPLE_RATE as f32;
        let peak = self.amplitude.clamp(0.0, 1.0) * i16::MAX as f32;

        let mut pcm = Vec::with_capacity(samples as usize * defaults::SAMPLE_WIDTH);
        for n in 0..samples {
            let sample = ((n as f32 * step).sin() * peak) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        pcm
    }
}

#[async_trait]
impl SynthesisProvider for ToneSynthesizer {
    fn name(&self) -> &str {
        "tone"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        Ok(self.render(text))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let pcm = self.render(text);
        let fragments: Vec<Vec<u8>> = pcm
            .chunks(self.fragment_bytes.max(1))
            .map(<[u8]>::to_vec)
            .collect();
        let pace = self.pace;

        let stream = async_stream::stream! {
            for fragment in fragments {
                if let Some(pace) = pace {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pace) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                yield Ok(fragment);
            }
        };
        Ok(stream.boxed())
    }
}

/// Scripted reply for one call to [`MockSynthesisProvider`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Fragments delivered in order.
    Fragments(Vec<Vec<u8>>),
    /// Fragments delivered in order, then a mid-stream error.
    FragmentsThenError(Vec<Vec<u8>>, String),
    /// The call itself fails.
    Fail(String),
    /// The stream never produces anything.
    Hang,
}

/// Mock synthesis provider for testing.
///
/// Each call pops the next scripted reply; once the script is empty every
/// call returns two bytes of silence per character in one fragment.
#[derive(Debug, Clone, Default)]
pub struct MockSynthesisProvider {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<Mutex<Vec<String>>>,
    fragment_delay: Option<Duration>,
}

impl MockSynthesisProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: MockReply) -> Self {
        self.lock_replies().push_back(reply);
        self
    }

    pub fn with_fragments(self, fragments: Vec<Vec<u8>>) -> Self {
        self.with_reply(MockReply::Fragments(fragments))
    }

    /// Sleeps before every fragment.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Texts passed to the provider so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<MockReply>> {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_reply(&self, text: &str) -> MockReply {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(text.to_string());
        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| MockReply::Fragments(vec![vec![0u8; text.chars().count() * 2]]))
    }
}

#[async_trait]
impl SynthesisProvider for MockSynthesisProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        match self.next_reply(text) {
            MockReply::Fragments(fragments) => Ok(fragments.concat()),
            MockReply::FragmentsThenError(_, message) | MockReply::Fail(message) => {
                Err(ParleyError::Synthesis { message })
            }
            MockReply::Hang => std::future::pending().await,
        }
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        let (fragments, error) = match self.next_reply(text) {
            MockReply::Fragments(fragments) => (fragments, None),
            MockReply::FragmentsThenError(fragments, message) => (fragments, Some(message)),
            MockReply::Fail(message) => return Err(ParleyError::Synthesis { message }),
            MockReply::Hang => return Ok(stream::pending().boxed()),
        };
        let delay = self.fragment_delay;

        let stream = async_stream::stream! {
            for fragment in fragments {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return;
                }
                yield Ok(fragment);
            }
            if let Some(message) = error {
                yield Err(ParleyError::Synthesis { message });
            }
        };
        Ok(stream.boxed())
    }
}
