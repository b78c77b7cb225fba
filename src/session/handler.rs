//! Server-side message handling for one connection.
//!
//! The reader loop feeds client messages in; every outbound message goes
//! through [`Outbound`], whose gate orders reply traffic against
//! `barge-in-ack`: once the ack is queued, nothing from the cancelled reply
//! can follow it.

use crate::audio::denoise::{Denoiser, denoise_or_raw};
use crate::audio::pcm::{AudioFrame, SpeechSegment};
use crate::error::{ParleyError, Result};
use crate::session::cancellation::CancellationController;
use crate::session::context::AudioContext;
use crate::session::engines::{ConversationTurn, ResponseGenerator, ResponseRequest, Transcriber};
use crate::session::state::{ConnectionSession, lock, record_exchange};
use crate::synthesis::SynthesisChunkBuffer;
use crate::transport::protocol::{ChatMode, ClientMessage, ServerMessage};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sending half of a connection's bounded outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerMessage>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            tx,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Queues `message`, waiting for capacity.
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.push(message).await
    }

    /// Queues `message` only if `token` is still live. Returns whether it
    /// was queued.
    pub async fn send_unless_cancelled(
        &self,
        message: ServerMessage,
        token: &CancellationToken,
    ) -> Result<bool> {
        let _gate = self.gate.lock().await;
        if token.is_cancelled() {
            return Ok(false);
        }
        self.push(message).await?;
        Ok(true)
    }

    /// Runs `before` and queues `message` as one step under the gate.
    pub async fn send_after<F: FnOnce()>(&self, before: F, message: ServerMessage) -> Result<()> {
        let _gate = self.gate.lock().await;
        before();
        self.push(message).await
    }

    /// Surfaces a failure to the client. Rejected credentials become
    /// `auth_required`; everything else is an `error` message.
    pub async fn report(&self, error: &ParleyError) {
        let message = if error.is_auth_failure() {
            ServerMessage::AuthRequired {
                message: error.to_string(),
            }
        } else {
            ServerMessage::error(error.to_string())
        };
        if let Err(e) = self.send(message).await {
            tracing::debug!(error = %e, original = %error, "Could not report error, connection gone");
        }
    }

    async fn push(&self, message: ServerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ParleyError::TransportClosed)
    }
}

/// Drives one [`ConnectionSession`]: applies client messages and runs each
/// received speech segment as a turn on its own task.
pub struct SessionHandler {
    session: ConnectionSession,
    outbound: Outbound,
    turn: Option<JoinHandle<()>>,
}

impl SessionHandler {
    pub fn new(session: ConnectionSession, outbound: Outbound) -> Self {
        Self {
            session,
            outbound,
            turn: None,
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Sends the `connected` greeting.
    pub async fn greet(&self) -> Result<()> {
        self.outbound
            .send(ServerMessage::Connected {
                conversation_id: self.session.conversation_id().to_string(),
            })
            .await
    }

    /// Handles a text frame. Malformed JSON is answered with an `error`.
    pub async fn handle_text(&mut self, text: &str) -> Result<()> {
        match ClientMessage::from_json(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed client message");
                self.outbound
                    .send(ServerMessage::error(format!("Invalid message: {}", e)))
                    .await
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Config {
                stt_engine,
                tts_engine,
                chat_mode,
                noise_reduction,
            } => {
                let mut fallbacks = Vec::new();
                if let Some(id) = stt_engine {
                    fallbacks.extend(self.session.select_transcriber(&id));
                }
                if let Some(id) = tts_engine {
                    fallbacks.extend(self.session.select_synthesizer(&id));
                }
                if let Some(mode) = chat_mode {
                    self.session.set_chat_mode(mode);
                }
                if let Some(enabled) = noise_reduction {
                    self.session.set_noise_reduction(enabled);
                }
                tracing::info!(
                    stt = self.session.stt_id(),
                    tts = self.session.tts_id(),
                    mode = %self.session.chat_mode(),
                    noise_reduction = self.session.noise_reduction(),
                    "Session configured"
                );
                for error in fallbacks {
                    self.outbound.report(&error).await;
                }
                Ok(())
            }
            ClientMessage::AudioContext(context) => {
                tracing::debug!(datetime = %context.datetime, timezone = %context.timezone, "Audio context updated");
                self.session.set_context(context);
                Ok(())
            }
            ClientMessage::BargeIn => self.barge_in().await,
        }
    }

    /// Handles a binary frame holding one captured speech segment.
    pub async fn handle_audio(&mut self, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let frame = match AudioFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.outbound.report(&e).await;
                return Ok(());
            }
        };

        if let Some(previous) = self.turn.take()
            && !previous.is_finished()
        {
            tracing::debug!("New speech before the previous turn finished, superseding it");
            previous.abort();
        }

        let turn = Turn {
            audio: frame,
            transcriber: self.session.transcriber(),
            responder: self.session.responder(),
            buffer: self.session.chunk_buffer(),
            chat_mode: self.session.chat_mode(),
            denoiser: self.session.active_denoiser(),
            history: self.session.history_handle(),
            context: self.session.context().cloned(),
            controller: self.session.controller(),
            outbound: self.outbound.clone(),
        };
        self.turn = Some(tokio::spawn(turn.run()));
        Ok(())
    }

    /// Cancels the active reply and acknowledges. The ack is sent even when
    /// nothing was in flight, since the client waits for it.
    pub async fn barge_in(&self) -> Result<()> {
        let controller = self.session.controller();
        self.outbound
            .send_after(
                || {
                    lock(&controller).barge_in(None);
                },
                ServerMessage::BargeInAck,
            )
            .await
    }

    /// Waits for the current turn, if any, to finish.
    pub async fn wait_idle(&mut self) {
        if let Some(turn) = self.turn.take()
            && let Err(e) = turn.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Turn task panicked");
        }
    }

    /// Tears the connection's work down.
    pub async fn close(mut self) {
        lock(&self.session.controller()).disconnect(None);
        if let Some(turn) = self.turn.take() {
            turn.abort();
            let _ = turn.await;
        }
        tracing::debug!(conversation = %self.session.conversation_id(), "Session closed");
    }
}

/// One user utterance and the reply to it.
struct Turn {
    audio: AudioFrame,
    transcriber: Arc<dyn Transcriber>,
    responder: Arc<dyn ResponseGenerator>,
    buffer: SynthesisChunkBuffer,
    chat_mode: ChatMode,
    denoiser: Option<Arc<dyn Denoiser>>,
    history: Arc<Mutex<Vec<ConversationTurn>>>,
    context: Option<AudioContext>,
    controller: Arc<Mutex<CancellationController>>,
    outbound: Outbound,
}

impl Turn {
    async fn run(self) {
        let outbound = self.outbound.clone();
        if let Err(e) = self.execute().await {
            if matches!(e, ParleyError::TransportClosed) {
                tracing::debug!("Connection closed during turn");
            } else {
                tracing::warn!(error = %e, "Turn failed");
                outbound.report(&e).await;
            }
        }
    }

    async fn execute(self) -> Result<()> {
        let audio = match &self.denoiser {
            Some(denoiser) => AudioFrame::from_samples(&denoise_or_raw(
                Some(denoiser.as_ref()),
                &self.audio.samples(),
            )),
            None => self.audio.clone(),
        };
        let segment = SpeechSegment::from_frame(audio, Instant::now());
        let started = Instant::now();

        let Some(text) = self.transcriber.transcribe(segment).await? else {
            tracing::debug!(engine = self.transcriber.name(), "No speech recognized");
            return Ok(());
        };
        let text = text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }
        tracing::info!(
            engine = self.transcriber.name(),
            ms = started.elapsed().as_millis() as u64,
            "Transcribed: {}",
            text
        );
        self.outbound
            .send(ServerMessage::Transcript {
                transcript: text.clone(),
            })
            .await?;

        let token = lock(&self.controller).begin_response();
        let request = ResponseRequest {
            history: lock(&self.history).clone(),
            text: text.clone(),
            context: self.context.clone(),
        };

        let delivered = match self.chat_mode {
            ChatMode::Single => self.respond_single(&request, &token).await,
            ChatMode::Stream => self.respond_stream(&request, &token).await,
        };

        {
            let mut controller = lock(&self.controller);
            if !token.is_cancelled() {
                controller.complete();
            }
        }

        match delivered {
            Ok(reply) => {
                record_exchange(&self.history, &text, &reply);
                Ok(())
            }
            Err(e) => {
                record_exchange(&self.history, &text, "");
                Err(e)
            }
        }
    }

    /// Sends the whole reply with its audio in one `agent` message.
    async fn respond_single(
        &self,
        request: &ResponseRequest,
        token: &CancellationToken,
    ) -> Result<String> {
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(String::new()),
            reply = self.responder.respond(request) => reply?,
        };

        let session = self.buffer.session(token.clone());
        let mut audio = self
            .buffer
            .stream(session, futures::stream::iter(vec![reply.clone()]));
        let mut frames = Vec::new();
        let mut failure = None;
        while let Some(item) = audio.next().await {
            match item {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let speech_audio = (!frames.is_empty()).then(|| AudioFrame::concat(&frames).to_base64());
        let sent = self
            .outbound
            .send_unless_cancelled(
                ServerMessage::Agent {
                    message: reply.clone(),
                    speech_audio,
                },
                token,
            )
            .await?;
        if !sent {
            return Ok(String::new());
        }
        if let Some(e) = failure {
            self.outbound.report(&e).await;
        }
        Ok(reply)
    }

    /// Streams text deltas and audio chunks as they become available.
    /// Returns the text that reached the client.
    async fn respond_stream(
        &self,
        request: &ResponseRequest,
        token: &CancellationToken,
    ) -> Result<String> {
        let deltas = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(String::new()),
            deltas = self.responder.respond_stream(request, token.clone()) => deltas?,
        };

        let (text_tx, text_rx) = futures::channel::mpsc::unbounded::<String>();
        let session = self.buffer.session(token.clone());
        let audio = self.buffer.stream(session, text_rx);
        let outbound = &self.outbound;

        let text_side = async move {
            let mut deltas = deltas;
            let mut delivered = String::new();
            let mut failure = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = deltas.next() => next,
                };
                match next {
                    Some(Ok(delta)) => {
                        if delta.is_empty() {
                            continue;
                        }
                        let message = ServerMessage::AgentStream {
                            delta: delta.clone(),
                        };
                        if !outbound.send_unless_cancelled(message, token).await? {
                            break;
                        }
                        delivered.push_str(&delta);
                        // The receiver lives until the audio side ends.
                        let _ = text_tx.unbounded_send(delta);
                    }
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                }
            }
            drop(text_tx);
            Ok::<_, ParleyError>((delivered, failure))
        };

        let audio_side = async move {
            let mut audio = audio;
            let mut chunks = 0usize;
            while let Some(item) = audio.next().await {
                match item {
                    Ok(frame) => {
                        let message = ServerMessage::AudioChunk {
                            data: frame.to_base64(),
                        };
                        if !outbound.send_unless_cancelled(message, token).await? {
                            break;
                        }
                        chunks += 1;
                    }
                    Err(e) => {
                        outbound.report(&e).await;
                        break;
                    }
                }
            }
            Ok::<_, ParleyError>(chunks)
        };

        let (text_result, audio_result) = tokio::join!(text_side, audio_side);
        let (delivered, failure) = text_result?;
        let chunks = audio_result?;
        if let Some(e) = failure {
            tracing::warn!(error = %e, "Response stream failed");
            outbound.report(&e).await;
        }

        if outbound
            .send_unless_cancelled(ServerMessage::AgentStreamComplete, token)
            .await?
        {
            tracing::info!(chars = delivered.chars().count(), chunks, "Reply streamed");
        } else {
            tracing::info!(chars = delivered.chars().count(), chunks, "Reply interrupted");
        }
        Ok(delivered)
    }
}
