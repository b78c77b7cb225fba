//! Transcription and response collaborators, and the registry that picks
//! them by id.

use crate::audio::pcm::SpeechSegment;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::session::context::AudioContext;
use crate::synthesis::provider::{SynthesisProvider, ToneSynthesizer};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `None` when the segment holds no recognizable speech.
    async fn transcribe(&self, segment: SpeechSegment) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// Everything the response generator gets for one turn.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub history: Vec<ConversationTurn>,
    pub text: String,
    pub context: Option<AudioContext>,
}

/// Produces the assistant's reply to a user turn.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(&self, request: &ResponseRequest) -> Result<String>;

    /// Streams the reply as text deltas. Defaults to one delta holding the
    /// whole [`ResponseGenerator::respond`] result.
    async fn respond_stream(
        &self,
        request: &ResponseRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String>>> {
        if cancel.is_cancelled() {
            return Ok(stream::empty().boxed());
        }
        let text = self.respond(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// Offline transcriber that describes the segment instead of recognizing it.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderTranscriber;

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn transcribe(&self, segment: SpeechSegment) -> Result<Option<String>> {
        if segment.sample_count() == 0 || segment.energy() <= f32::EPSILON {
            return Ok(None);
        }
        let seconds = segment.duration(defaults::SAMPLE_RATE).as_secs_f32();
        Ok(Some(format!("{:.1} seconds of speech", seconds)))
    }
}

/// Mock transcriber for testing.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    response: Option<String>,
    should_fail: bool,
}

impl MockTranscriber {
    pub fn new(response: &str) -> Self {
        Self {
            response: Some(response.to_string()),
            should_fail: false,
        }
    }

    /// Configure the mock to report "no speech".
    pub fn silent() -> Self {
        Self {
            response: None,
            should_fail: false,
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    fn name(&self) -> &str {
        "mock"
    }

    async fn transcribe(&self, _segment: SpeechSegment) -> Result<Option<String>> {
        if self.should_fail {
            return Err(ParleyError::Transcription {
                message: "mock transcription failure".to_string(),
            });
        }
        Ok(self.response.clone())
    }
}

/// Replies by repeating the user, streaming word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoResponder {
    delay: Option<Duration>,
    fail: bool,
}

impl EchoResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` before each streamed word.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    fn reply(&self, request: &ResponseRequest) -> Result<String> {
        if self.fail {
            return Err(ParleyError::Generation {
                message: "echo responder failure".to_string(),
            });
        }
        Ok(format!("You said: {}.", request.text.trim_end_matches('.')))
    }
}

#[async_trait]
impl ResponseGenerator for EchoResponder {
    fn name(&self) -> &str {
        "echo"
    }

    async fn respond(&self, request: &ResponseRequest) -> Result<String> {
        self.reply(request)
    }

    async fn respond_stream(
        &self,
        request: &ResponseRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let reply = self.reply(request)?;
        let words: Vec<String> = reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.delay;

        let stream = async_stream::stream! {
            for word in words {
                if let Some(delay) = delay {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                yield Ok(word);
            }
        };
        Ok(stream.boxed())
    }
}

/// An engine picked from the registry, with the configuration error to
/// report when the requested id was unknown.
pub struct Resolved<T: ?Sized> {
    pub engine: Arc<T>,
    pub fallback: Option<ParleyError>,
}

/// Engines available to connections, by id.
#[derive(Clone)]
pub struct EngineRegistry {
    transcribers: HashMap<String, Arc<dyn Transcriber>>,
    synthesizers: HashMap<String, Arc<dyn SynthesisProvider>>,
    responder: Arc<dyn ResponseGenerator>,
    default_stt: (String, Arc<dyn Transcriber>),
    default_tts: (String, Arc<dyn SynthesisProvider>),
}

impl EngineRegistry {
    /// Registry holding only the built-in offline engines.
    pub fn builtin() -> Self {
        let stt: Arc<dyn Transcriber> = Arc::new(PlaceholderTranscriber);
        let tts: Arc<dyn SynthesisProvider> = Arc::new(ToneSynthesizer::default());
        let mut registry = Self {
            transcribers: HashMap::new(),
            synthesizers: HashMap::new(),
            responder: Arc::new(EchoResponder::new()),
            default_stt: (defaults::STT_ENGINE.to_string(), Arc::clone(&stt)),
            default_tts: (defaults::TTS_ENGINE.to_string(), Arc::clone(&tts)),
        };
        registry.register_transcriber(defaults::STT_ENGINE, stt);
        registry.register_synthesizer(defaults::TTS_ENGINE, tts);
        registry
    }

    pub fn register_transcriber(&mut self, id: &str, engine: Arc<dyn Transcriber>) {
        if self.default_stt.0 == id {
            self.default_stt.1 = Arc::clone(&engine);
        }
        self.transcribers.insert(id.to_string(), engine);
    }

    pub fn register_synthesizer(&mut self, id: &str, engine: Arc<dyn SynthesisProvider>) {
        if self.default_tts.0 == id {
            self.default_tts.1 = Arc::clone(&engine);
        }
        self.synthesizers.insert(id.to_string(), engine);
    }

    pub fn with_responder(mut self, responder: Arc<dyn ResponseGenerator>) -> Self {
        self.responder = responder;
        self
    }

    /// Makes `id` the fallback transcriber. It must be registered.
    pub fn set_default_transcriber(&mut self, id: &str) -> Result<()> {
        let engine = self
            .transcribers
            .get(id)
            .ok_or_else(|| ParleyError::UnknownEngine {
                kind: "stt".to_string(),
                id: id.to_string(),
            })?;
        self.default_stt = (id.to_string(), Arc::clone(engine));
        Ok(())
    }

    /// Makes `id` the fallback synthesizer. It must be registered.
    pub fn set_default_synthesizer(&mut self, id: &str) -> Result<()> {
        let engine = self
            .synthesizers
            .get(id)
            .ok_or_else(|| ParleyError::UnknownEngine {
                kind: "tts".to_string(),
                id: id.to_string(),
            })?;
        self.default_tts = (id.to_string(), Arc::clone(engine));
        Ok(())
    }

    pub fn default_transcriber_id(&self) -> &str {
        &self.default_stt.0
    }

    pub fn default_synthesizer_id(&self) -> &str {
        &self.default_tts.0
    }

    pub fn transcriber_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.transcribers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn synthesizer_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.synthesizers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn responder(&self) -> Arc<dyn ResponseGenerator> {
        Arc::clone(&self.responder)
    }

    pub fn transcriber(&self, id: Option<&str>) -> Resolved<dyn Transcriber> {
        resolve(&self.transcribers, "stt", id, &self.default_stt)
    }

    pub fn synthesizer(&self, id: Option<&str>) -> Resolved<dyn SynthesisProvider> {
        resolve(&self.synthesizers, "tts", id, &self.default_tts)
    }
}

fn resolve<T: ?Sized>(
    engines: &HashMap<String, Arc<T>>,
    kind: &str,
    id: Option<&str>,
    default: &(String, Arc<T>),
) -> Resolved<T> {
    let (default_id, default_engine) = default;
    let requested = id.unwrap_or(default_id.as_str());
    if let Some(engine) = engines.get(requested) {
        return Resolved {
            engine: Arc::clone(engine),
            fallback: None,
        };
    }

    tracing::warn!(kind, id = requested, fallback = %default_id, "Unknown engine, using default");
    Resolved {
        engine: Arc::clone(default_engine),
        fallback: Some(ParleyError::UnknownEngine {
            kind: kind.to_string(),
            id: requested.to_string(),
        }),
    }
}
