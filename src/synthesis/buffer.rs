//! Streaming synthesis: response text in, fixed-size PCM chunks out.

use crate::audio::pcm::AudioFrame;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::synthesis::aligner::{ChunkAssembler, SampleAligner};
use crate::synthesis::provider::SynthesisProvider;
use crate::synthesis::trigger::{TextTrigger, TriggerConfig};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Size of every emitted chunk except the last.
    pub chunk_bytes: usize,
    pub trigger: TriggerConfig,
    /// Longest wait for the provider's next fragment.
    pub provider_timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: defaults::OUTPUT_CHUNK_BYTES,
            trigger: TriggerConfig::default(),
            provider_timeout: Duration::from_millis(defaults::PROVIDER_TIMEOUT_MS),
        }
    }
}

/// State of one in-flight response.
///
/// Created per turn from a fresh cancellation token; once cancelled it is
/// never resumed.
#[derive(Debug)]
pub struct SynthesisSession {
    id: Uuid,
    cancel: CancellationToken,
    trigger: TextTrigger,
    assembler: ChunkAssembler,
}

impl SynthesisSession {
    pub fn new(cancel: CancellationToken, config: &SynthesisConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel,
            trigger: TextTrigger::new(config.trigger),
            assembler: ChunkAssembler::new(config.chunk_bytes, defaults::SAMPLE_WIDTH),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Turns a response text stream into aligned, fixed-size audio chunks.
///
/// Works with any [`SynthesisProvider`]; alignment only depends on the sample
/// width and the chunk size.
#[derive(Clone)]
pub struct SynthesisChunkBuffer {
    provider: Arc<dyn SynthesisProvider>,
    config: SynthesisConfig,
}

impl SynthesisChunkBuffer {
    pub fn new(provider: Arc<dyn SynthesisProvider>, config: SynthesisConfig) -> Self {
        Self { provider, config }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Starts a session bound to `cancel`.
    pub fn session(&self, cancel: CancellationToken) -> SynthesisSession {
        SynthesisSession::new(cancel, &self.config)
    }

    /// Streams audio for `text` within `session`.
    ///
    /// Ends without an error when the session is cancelled. Yields a terminal
    /// `Err` only if the provider fails before producing any audio; later
    /// failures skip the affected piece.
    pub fn stream<S>(
        &self,
        mut session: SynthesisSession,
        text: S,
    ) -> BoxStream<'static, Result<AudioFrame>>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        let timeout = self.config.provider_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let stream = async_stream::stream! {
            let cancel = session.cancel.clone();
            let mut text = Box::pin(text);
            let mut produced = false;
            let mut text_done = false;

            while !text_done {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = text.next() => next,
                };
                let pieces: Vec<String> = match next {
                    Some(delta) => session.trigger.push(&delta),
                    None => {
                        text_done = true;
                        session.trigger.finish().into_iter().collect()
                    }
                };

                for piece in pieces {
                    tracing::debug!(
                        session = %session.id,
                        chars = piece.chars().count(),
                        "Synthesizing piece"
                    );

                    let opened = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        opened = tokio::time::timeout(
                            timeout,
                            provider.synthesize_stream(&piece, cancel.clone()),
                        ) => opened,
                    };
                    let opened = opened.unwrap_or(Err(ParleyError::SynthesisTimeout { ms: timeout_ms }));
                    let mut fragments = match opened {
                        Ok(fragments) => fragments,
                        Err(e) => {
                            if !produced {
                                tracing::warn!(session = %session.id, error = %e, "Synthesis failed before any audio");
                                yield Err(e);
                                return;
                            }
                            tracing::warn!(session = %session.id, error = %e, "Synthesis failed, skipping piece");
                            continue;
                        }
                    };

                    let mut aligner = SampleAligner::new(defaults::SAMPLE_WIDTH);
                    let failure = loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            next = tokio::time::timeout(timeout, fragments.next()) => next,
                        };
                        match next {
                            Err(_) => break Some(ParleyError::SynthesisTimeout { ms: timeout_ms }),
                            Ok(None) => break None,
                            Ok(Some(Err(e))) => break Some(e),
                            Ok(Some(Ok(bytes))) => {
                                if !bytes.is_empty() {
                                    produced = true;
                                }
                                let aligned = aligner.push(&bytes);
                                for frame in session.assembler.push(&aligned) {
                                    if cancel.is_cancelled() {
                                        return;
                                    }
                                    yield Ok(frame);
                                }
                            }
                        }
                    };

                    let dangling = aligner.finish();
                    if dangling > 0 {
                        tracing::debug!(session = %session.id, bytes = dangling, "Discarding partial sample at end of piece");
                    }

                    if let Some(e) = failure {
                        if !produced {
                            tracing::warn!(session = %session.id, error = %e, "Synthesis failed before any audio");
                            yield Err(e);
                            return;
                        }
                        tracing::warn!(session = %session.id, error = %e, "Synthesis failed, skipping rest of piece");
                    }
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if let Some(frame) = session.assembler.flush() {
                yield Ok(frame);
            }
            tracing::debug!(session = %session.id, pieces = session.trigger.triggered(), "Synthesis complete");
        };
        stream.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::provider::{MockReply, MockSynthesisProvider, ToneSynthesizer};
    use futures::stream;
    use std::time::Instant;

    fn text(parts: &[&str]) -> impl Stream<Item = String> + Send + 'static {
        stream::iter(parts.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    fn config(chunk_bytes: usize) -> SynthesisConfig {
        SynthesisConfig {
            chunk_bytes,
            ..SynthesisConfig::default()
        }
    }

    async fn run(
        provider: Arc<dyn SynthesisProvider>,
        config: SynthesisConfig,
        parts: &[&str],
    ) -> Vec<Result<AudioFrame>> {
        let buffer = SynthesisChunkBuffer::new(provider, config);
        let session = buffer.session(CancellationToken::new());
        buffer.stream(session, text(parts)).collect().await
    }

    fn bytes_of(items: &[Result<AudioFrame>]) -> Vec<u8> {
        items
            .iter()
            .flat_map(|item| item.as_ref().unwrap().as_bytes().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_two_sentences_trigger_twice_with_fixed_chunks() {
        let tone = Arc::new(ToneSynthesizer::default());
        let expected = [
            tone.synthesize("Hello there.").await.unwrap(),
            tone.synthesize("How are you?").await.unwrap(),
        ]
        .concat();

        let items = run(tone, SynthesisConfig::default(), &["Hello there. How are you?"]).await;

        assert_eq!(bytes_of(&items), expected);
        let (last, full) = items.split_last().unwrap();
        assert!(!full.is_empty());
        assert!(full.iter().all(|f| f.as_ref().unwrap().byte_len() == 16384));
        assert!(last.as_ref().unwrap().byte_len() <= 16384);
    }

    #[tokio::test]
    async fn test_provider_sees_each_piece() {
        let mock = MockSynthesisProvider::new();
        run(
            Arc::new(mock.clone()),
            config(64),
            &["Hello ", "there. How", " are you?"],
        )
        .await;
        assert_eq!(mock.calls(), vec!["Hello there.", "How are you?"]);
    }

    #[tokio::test]
    async fn test_odd_fragments_are_realigned() {
        let mock = MockSynthesisProvider::new().with_fragments(vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        let items = run(Arc::new(mock), config(4), &["Single piece"]).await;

        let frames: Vec<Vec<u8>> = items
            .into_iter()
            .map(|f| f.unwrap().into_bytes())
            .collect();
        // Trailing byte 7 has no partner and is dropped
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6]]);
    }

    #[tokio::test]
    async fn test_carryover_is_not_merged_across_pieces() {
        let mock = MockSynthesisProvider::new()
            .with_fragments(vec![vec![1, 2, 3]])
            .with_fragments(vec![vec![4, 5]]);
        let items = run(Arc::new(mock), config(4), &["First one. Second one."]).await;
        assert_eq!(bytes_of(&items), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_failure_before_any_audio_is_terminal() {
        let mock = MockSynthesisProvider::new()
            .with_reply(MockReply::Fail("provider down".to_string()))
            .with_fragments(vec![vec![0; 4]]);
        let items = run(Arc::new(mock.clone()), config(4), &["First one. Second one."]).await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ParleyError::Synthesis { .. })));
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_after_audio_skips_piece() {
        let mock = MockSynthesisProvider::new()
            .with_fragments(vec![vec![1, 1]])
            .with_reply(MockReply::FragmentsThenError(vec![vec![2, 2]], "glitch".to_string()))
            .with_reply(MockReply::Fail("down".to_string()))
            .with_fragments(vec![vec![3, 3]]);
        let items = run(
            Arc::new(mock),
            config(2),
            &["Number one. Number two. Number three. Number four."],
        )
        .await;

        assert!(items.iter().all(|i| i.is_ok()));
        assert_eq!(bytes_of(&items), vec![1, 1, 2, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_provider_timeout_before_audio_is_terminal() {
        let mock = MockSynthesisProvider::new().with_reply(MockReply::Hang);
        let config = SynthesisConfig {
            provider_timeout: Duration::from_millis(50),
            ..config(4)
        };
        let items = run(Arc::new(mock), config, &["Hello there."]).await;
        assert!(matches!(
            items.as_slice(),
            [Err(ParleyError::SynthesisTimeout { ms: 50 })]
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_n_chunks_stops_output() {
        let mock = MockSynthesisProvider::new().with_fragments(vec![vec![0; 2]; 10]);
        let buffer = SynthesisChunkBuffer::new(Arc::new(mock), config(2));
        let cancel = CancellationToken::new();
        let mut stream = buffer.stream(buffer.session(cancel.clone()), text(&["Long answer."]));

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_provider_promptly() {
        let mock = MockSynthesisProvider::new().with_reply(MockReply::Hang);
        let buffer = SynthesisChunkBuffer::new(Arc::new(mock), config(4));
        let cancel = CancellationToken::new();
        let mut stream = buffer.stream(buffer.session(cancel.clone()), text(&["Hello there."]));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(matches!(next, Ok(None)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_empty_text_yields_nothing() {
        let mock = MockSynthesisProvider::new();
        let items = run(Arc::new(mock.clone()), config(4), &["", "  "]).await;
        assert!(items.is_empty());
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let buffer = SynthesisChunkBuffer::new(
            Arc::new(MockSynthesisProvider::new()),
            SynthesisConfig::default(),
        );
        let a = buffer.session(CancellationToken::new());
        let b = buffer.session(CancellationToken::new());
        assert_ne!(a.id(), b.id());
        assert!(!a.is_cancelled());
        assert_eq!(buffer.provider_name(), "mock");
    }
}
