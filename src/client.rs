//! Conversation client: captured speech out, replies in, local playback and
//! barge-in.
//!
//! The loop multiplexes four inputs: capture events from the gate, transport
//! events from the server, playback events from the scheduler and a poll
//! tick that drives the scheduler against its clock.

use crate::audio::capture_gate::CaptureEvent;
use crate::audio::pcm::AudioFrame;
use crate::error::Result;
use crate::playback::output::AudioOutput;
use crate::playback::scheduler::{PlaybackEvent, PlaybackScheduler};
use crate::session::cancellation::{BargeIn, CancellationController, Interruptible, PeerNotifier};
use crate::session::context::{AudioContext, ContextTracker};
use crate::transport::client::{TransportClient, TransportEvent, TransportSender};
use crate::transport::protocol::{ChatMode, ClientMessage, ServerMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct VoiceClientConfig {
    pub chat_mode: ChatMode,
    pub stt_engine: Option<String>,
    pub tts_engine: Option<String>,
    pub noise_reduction: bool,
    /// Scheduler poll period.
    pub poll_interval: Duration,
    /// Once capture has ended, how long to stay quiet before exiting.
    pub linger: Duration,
}

impl Default for VoiceClientConfig {
    fn default() -> Self {
        Self {
            chat_mode: ChatMode::default(),
            stt_engine: None,
            tts_engine: None,
            noise_reduction: false,
            poll_interval: Duration::from_millis(20),
            linger: Duration::from_secs(2),
        }
    }
}

/// What the client observed, for display.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Transcript(String),
    AgentDelta(String),
    AgentMessage(String),
    ReplyComplete,
    Playback(PlaybackEvent),
    /// Local speech interrupted the reply.
    BargeIn,
    ServerError(String),
    AuthRequired(String),
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected(String),
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub segments_sent: u64,
    pub chunks_played: u64,
    pub chunks_dropped: u64,
    pub barge_ins: u64,
}

/// Sends `barge-in` and starts discarding reply audio until the server acks.
struct BargeInNotifier {
    sender: TransportSender,
    awaiting_ack: Arc<AtomicBool>,
}

impl PeerNotifier for BargeInNotifier {
    fn notify_barge_in(&self) {
        self.awaiting_ack.store(true, Ordering::SeqCst);
        if let Err(e) = self.sender.try_send(ClientMessage::BargeIn) {
            tracing::warn!(error = %e, "Could not send barge-in");
        }
    }
}

pub struct VoiceClient<O: AudioOutput> {
    transport: TransportClient,
    sender: TransportSender,
    scheduler: PlaybackScheduler<O>,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    controller: CancellationController,
    awaiting_ack: Arc<AtomicBool>,
    /// The server is still producing the current reply.
    reply_open: bool,
    contexts: ContextTracker,
    config: VoiceClientConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
    stats: ClientStats,
    last_activity: Instant,
    connections: u32,
}

enum Flow {
    Continue,
    Stop,
}

impl<O: AudioOutput> VoiceClient<O> {
    pub fn new(
        transport: TransportClient,
        scheduler: PlaybackScheduler<O>,
        playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
        config: VoiceClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let sender = transport.sender();
        let awaiting_ack = Arc::new(AtomicBool::new(false));
        let controller = CancellationController::new().with_notifier(Box::new(BargeInNotifier {
            sender: sender.clone(),
            awaiting_ack: Arc::clone(&awaiting_ack),
        }));
        let (events, events_rx) = mpsc::unbounded_channel();

        let client = Self {
            transport,
            sender,
            scheduler,
            playback_events,
            controller,
            awaiting_ack,
            reply_open: false,
            contexts: ContextTracker::new(),
            config,
            events,
            stats: ClientStats::default(),
            last_activity: Instant::now(),
            connections: 0,
        };
        (client, events_rx)
    }

    /// Runs until the transport closes, or until `capture` has ended and the
    /// last reply has finished playing.
    pub async fn run(
        mut self,
        mut capture: mpsc::UnboundedReceiver<CaptureEvent>,
    ) -> Result<ClientStats> {
        // The first connection is already up; configure it before any audio.
        self.send_config().await?;

        let mut tick = time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut capture_open = true;

        loop {
            let flow = tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.scheduler.poll() {
                        tracing::warn!(error = %e, "Playback scheduling failed");
                        self.scheduler.stop();
                    }
                    if !capture_open && self.is_quiet() {
                        tracing::info!("Input finished and reply played, closing");
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
                Some(event) = self.playback_events.recv() => {
                    self.on_playback(event);
                    Flow::Continue
                }
                captured = capture.recv(), if capture_open => {
                    match captured {
                        Some(event) => self.on_capture(event).await,
                        None => {
                            tracing::debug!("Capture ended");
                            capture_open = false;
                            self.last_activity = Instant::now();
                            Flow::Continue
                        }
                    }
                }
                event = self.transport.next_event() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => Flow::Stop,
                },
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        let playback: &mut dyn Interruptible = &mut self.scheduler;
        self.controller.disconnect(Some(playback));
        self.transport.close().await?;
        self.stats.barge_ins = self.controller.barge_in_count();
        self.emit(ClientEvent::Closed);
        Ok(self.stats)
    }

    fn is_quiet(&self) -> bool {
        !self.scheduler.is_active()
            && !self.controller.is_responding()
            && self.last_activity.elapsed() >= self.config.linger
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn send_config(&self) -> Result<()> {
        self.sender
            .send(ClientMessage::Config {
                stt_engine: self.config.stt_engine.clone(),
                tts_engine: self.config.tts_engine.clone(),
                chat_mode: Some(self.config.chat_mode),
                noise_reduction: Some(self.config.noise_reduction),
            })
            .await
    }

    async fn on_capture(&mut self, event: CaptureEvent) -> Flow {
        match event {
            CaptureEvent::SpeechStart => {
                self.last_activity = Instant::now();
                let playback: &mut dyn Interruptible = &mut self.scheduler;
                if self.controller.barge_in(Some(playback)) == BargeIn::Cancelled {
                    self.reply_open = false;
                    self.emit(ClientEvent::BargeIn);
                }
            }
            CaptureEvent::SpeechEnd(segment) => {
                self.last_activity = Instant::now();
                if let Some(context) = self.contexts.observe(AudioContext::now())
                    && let Err(e) = self.sender.send(ClientMessage::AudioContext(context)).await
                {
                    tracing::warn!(error = %e, "Could not send audio context");
                }
                let frame = segment.into_frame();
                tracing::debug!(samples = frame.sample_count(), "Sending speech segment");
                match self.sender.send_audio(frame).await {
                    Ok(()) => self.stats.segments_sent += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not send speech");
                        return Flow::Stop;
                    }
                }
            }
            CaptureEvent::Misfire => {}
        }
        Flow::Continue
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        if event == PlaybackEvent::AllAudioFinished {
            // A drained queue mid-reply is a gap between chunks, not the end.
            if self.reply_open {
                tracing::debug!("Playback drained before the reply completed");
            } else {
                self.controller.complete();
            }
            self.last_activity = Instant::now();
        }
        self.emit(ClientEvent::Playback(event));
    }

    async fn on_transport(&mut self, event: TransportEvent) -> Flow {
        match event {
            TransportEvent::Connected => {
                self.connections += 1;
                if self.connections > 1 {
                    self.awaiting_ack.store(false, Ordering::SeqCst);
                    self.reply_open = false;
                    self.contexts.reset();
                    if let Err(e) = self.send_config().await {
                        tracing::warn!(error = %e, "Could not send config");
                    }
                }
                self.emit(ClientEvent::Connected);
            }
            TransportEvent::Message(message) => {
                self.last_activity = Instant::now();
                self.on_server_message(message);
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.emit(ClientEvent::Reconnecting { attempt, delay });
            }
            TransportEvent::Disconnected { reason } => {
                self.reply_open = false;
                let playback: &mut dyn Interruptible = &mut self.scheduler;
                self.controller.disconnect(Some(playback));
                self.emit(ClientEvent::Disconnected(reason));
            }
            TransportEvent::AuthRequired { message } => {
                self.emit(ClientEvent::AuthRequired(message));
            }
            TransportEvent::Closed => return Flow::Stop,
        }
        Flow::Continue
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        let discarding = self.awaiting_ack.load(Ordering::SeqCst);
        match message {
            ServerMessage::Connected { conversation_id } => {
                tracing::info!(conversation = %conversation_id, "Conversation started");
            }
            ServerMessage::Transcript { transcript } => {
                self.emit(ClientEvent::Transcript(transcript));
            }
            ServerMessage::AgentStream { delta } => {
                if discarding {
                    return;
                }
                self.ensure_responding();
                self.emit(ClientEvent::AgentDelta(delta));
            }
            ServerMessage::AudioChunk { data } => {
                if discarding {
                    self.stats.chunks_dropped += 1;
                    tracing::debug!("Dropping audio chunk of cancelled reply");
                    return;
                }
                self.ensure_responding();
                self.play(&data, false);
            }
            ServerMessage::Agent {
                message,
                speech_audio,
            } => {
                if discarding {
                    return;
                }
                self.ensure_responding();
                self.reply_open = false;
                self.emit(ClientEvent::AgentMessage(message));
                match speech_audio {
                    Some(audio) => self.play(&audio, true),
                    None => self.controller.complete(),
                }
            }
            ServerMessage::AgentStreamComplete => {
                if discarding {
                    return;
                }
                self.reply_open = false;
                if !self.scheduler.is_active() {
                    self.controller.complete();
                }
                self.emit(ClientEvent::ReplyComplete);
            }
            ServerMessage::BargeInAck => {
                self.awaiting_ack.store(false, Ordering::SeqCst);
                tracing::debug!("Barge-in acknowledged");
            }
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "Server reported an error");
                self.emit(ClientEvent::ServerError(message));
            }
            ServerMessage::AuthRequired { message } => {
                self.emit(ClientEvent::AuthRequired(message));
            }
        }
    }

    /// Marks the reply open, starting a response on its first traffic.
    fn ensure_responding(&mut self) {
        if !self.controller.is_responding() {
            self.controller.begin_response();
        }
        self.reply_open = true;
    }

    fn play(&mut self, base64: &str, single_shot: bool) {
        let frame = match AudioFrame::from_base64(base64) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable audio");
                return;
            }
        };
        let result = if single_shot {
            self.scheduler.play_once(frame)
        } else {
            self.scheduler.enqueue(frame)
        };
        match result {
            Ok(()) => self.stats.chunks_played += 1,
            Err(e) => tracing::warn!(error = %e, "Could not schedule audio"),
        }
    }
}

/// Forwards capture events from the pipeline thread into the async loop.
pub fn bridge_capture(
    events: crossbeam_channel::Receiver<CaptureEvent>,
) -> mpsc::UnboundedReceiver<CaptureEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("capture-bridge".to_string())
        .spawn(move || {
            for event in events.iter() {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to spawn capture bridge");
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::SpeechSegment;

    #[test]
    fn test_bridge_forwards_until_sender_drops() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut bridged = bridge_capture(rx);
        tx.send(CaptureEvent::SpeechStart).unwrap();
        tx.send(CaptureEvent::SpeechEnd(SpeechSegment::from_frame(
            AudioFrame::from_samples(&[1, 2, 3]),
            Instant::now(),
        )))
        .unwrap();
        drop(tx);

        assert!(matches!(
            bridged.blocking_recv(),
            Some(CaptureEvent::SpeechStart)
        ));
        assert!(matches!(
            bridged.blocking_recv(),
            Some(CaptureEvent::SpeechEnd(_))
        ));
        assert!(bridged.blocking_recv().is_none());
    }

    #[test]
    fn test_default_config_streams() {
        let config = VoiceClientConfig::default();
        assert_eq!(config.chat_mode, ChatMode::Stream);
        assert!(config.stt_engine.is_none());
    }
}
