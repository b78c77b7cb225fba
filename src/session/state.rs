//! Per-connection conversation state.

use crate::audio::denoise::{Denoiser, NoiseGateDenoiser};
use crate::error::ParleyError;
use crate::session::cancellation::CancellationController;
use crate::session::context::AudioContext;
use crate::session::engines::{
    ConversationTurn, EngineRegistry, ResponseGenerator, Role, Transcriber,
};
use crate::synthesis::{SynthesisChunkBuffer, SynthesisConfig, SynthesisProvider};
use crate::transport::protocol::ChatMode;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Per-connection defaults taken from the server configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionDefaults {
    pub chat_mode: ChatMode,
    pub noise_reduction: bool,
    pub synthesis: SynthesisConfig,
}

/// Everything one connection owns.
///
/// Engine changes through `config` only affect turns started afterwards.
pub struct ConnectionSession {
    conversation_id: Uuid,
    token: Option<String>,
    registry: Arc<EngineRegistry>,
    stt_id: String,
    tts_id: String,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn SynthesisProvider>,
    synthesis: SynthesisConfig,
    chat_mode: ChatMode,
    noise_reduction: bool,
    denoiser: Arc<dyn Denoiser>,
    history: Arc<Mutex<Vec<ConversationTurn>>>,
    context: Option<AudioContext>,
    controller: Arc<Mutex<CancellationController>>,
}

impl ConnectionSession {
    pub fn new(registry: Arc<EngineRegistry>, defaults: SessionDefaults) -> Self {
        let stt = registry.transcriber(None);
        let tts = registry.synthesizer(None);
        Self {
            conversation_id: Uuid::new_v4(),
            token: None,
            stt_id: registry.default_transcriber_id().to_string(),
            tts_id: registry.default_synthesizer_id().to_string(),
            transcriber: stt.engine,
            synthesizer: tts.engine,
            registry,
            synthesis: defaults.synthesis,
            chat_mode: defaults.chat_mode,
            noise_reduction: defaults.noise_reduction,
            denoiser: Arc::new(NoiseGateDenoiser::default()),
            history: Arc::new(Mutex::new(Vec::new())),
            context: None,
            controller: Arc::new(Mutex::new(CancellationController::new())),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_denoiser(mut self, denoiser: Arc<dyn Denoiser>) -> Self {
        self.denoiser = denoiser;
        self
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn stt_id(&self) -> &str {
        &self.stt_id
    }

    pub fn tts_id(&self) -> &str {
        &self.tts_id
    }

    pub fn chat_mode(&self) -> ChatMode {
        self.chat_mode
    }

    pub fn noise_reduction(&self) -> bool {
        self.noise_reduction
    }

    pub fn context(&self) -> Option<&AudioContext> {
        self.context.as_ref()
    }

    /// Selects the transcription engine. An unknown id falls back to the
    /// default and returns the error to report.
    pub fn select_transcriber(&mut self, id: &str) -> Option<ParleyError> {
        let resolved = self.registry.transcriber(Some(id));
        self.transcriber = resolved.engine;
        self.stt_id = match resolved.fallback {
            None => id.to_string(),
            Some(_) => self.registry.default_transcriber_id().to_string(),
        };
        resolved.fallback
    }

    /// Selects the synthesis engine, with the same fallback as
    /// [`ConnectionSession::select_transcriber`].
    pub fn select_synthesizer(&mut self, id: &str) -> Option<ParleyError> {
        let resolved = self.registry.synthesizer(Some(id));
        self.synthesizer = resolved.engine;
        self.tts_id = match resolved.fallback {
            None => id.to_string(),
            Some(_) => self.registry.default_synthesizer_id().to_string(),
        };
        resolved.fallback
    }

    pub fn set_chat_mode(&mut self, mode: ChatMode) {
        self.chat_mode = mode;
    }

    pub fn set_noise_reduction(&mut self, enabled: bool) {
        self.noise_reduction = enabled;
    }

    pub fn set_context(&mut self, context: AudioContext) {
        self.context = Some(context);
    }

    pub fn transcriber(&self) -> Arc<dyn Transcriber> {
        Arc::clone(&self.transcriber)
    }

    pub fn responder(&self) -> Arc<dyn ResponseGenerator> {
        self.registry.responder()
    }

    pub fn chunk_buffer(&self) -> SynthesisChunkBuffer {
        SynthesisChunkBuffer::new(Arc::clone(&self.synthesizer), self.synthesis.clone())
    }

    /// The denoiser to apply to received speech, if enabled.
    pub fn active_denoiser(&self) -> Option<Arc<dyn Denoiser>> {
        self.noise_reduction.then(|| Arc::clone(&self.denoiser))
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        lock(&self.history).clone()
    }

    pub fn history_handle(&self) -> Arc<Mutex<Vec<ConversationTurn>>> {
        Arc::clone(&self.history)
    }

    pub fn controller(&self) -> Arc<Mutex<CancellationController>> {
        Arc::clone(&self.controller)
    }
}

/// Appends a finished exchange. An interrupted reply is recorded with the
/// text that reached the client; an empty one is not recorded.
pub fn record_exchange(history: &Mutex<Vec<ConversationTurn>>, user: &str, assistant: &str) {
    let mut history = lock(history);
    history.push(ConversationTurn {
        role: Role::User,
        text: user.to_string(),
    });
    if !assistant.trim().is_empty() {
        history.push(ConversationTurn {
            role: Role::Assistant,
            text: assistant.to_string(),
        });
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
