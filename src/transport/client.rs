//! Reconnecting WebSocket client.
//!
//! A supervisor task owns the socket. It forwards outgoing frames, answers
//! pings, sends heartbeats and reconnects with exponential backoff after an
//! unexpected closure. A local [`TransportClient::close`] never reconnects,
//! and neither does a rejected credential.

use crate::audio::pcm::AudioFrame;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::protocol::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub token: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Outgoing frames buffered before senders wait.
    pub queue: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: defaults::SERVER_URL.to_string(),
            token: None,
            heartbeat_interval: Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS),
            reconnect: ReconnectPolicy::default(),
            queue: defaults::OUTBOUND_QUEUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Message(ServerMessage),
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected { reason: String },
    /// The credential was rejected; it has been dropped and no reconnect
    /// will follow.
    AuthRequired { message: String },
    /// The supervisor has stopped. Always the last event.
    Closed,
}

#[derive(Debug)]
enum Outgoing {
    Control(ClientMessage),
    Audio(Vec<u8>),
}

/// Cloneable handle for queueing frames from other tasks.
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::Sender<Outgoing>,
}

impl TransportSender {
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(Outgoing::Control(message))
            .await
            .map_err(|_| ParleyError::TransportClosed)
    }

    /// Sends one captured segment as a binary frame.
    pub async fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        self.tx
            .send(Outgoing::Audio(frame.into_bytes()))
            .await
            .map_err(|_| ParleyError::TransportClosed)
    }

    /// Non-blocking send for synchronous callers.
    pub fn try_send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .try_send(Outgoing::Control(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ParleyError::Other("Transport queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => ParleyError::TransportClosed,
            })
    }
}

struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct TransportClient {
    sender: TransportSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    runtime: Option<Runtime>,
}

impl TransportClient {
    /// Connects and starts the supervisor. The first connection is made
    /// before returning, so a bad URL or credential fails here.
    pub async fn connect(settings: ClientSettings) -> Result<Self> {
        let socket = open_socket(&settings.url, settings.token.as_deref()).await?;
        tracing::info!(url = %settings.url, "Connected to session server");

        let (commands_tx, commands_rx) = mpsc::channel(settings.queue.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = events_tx.send(TransportEvent::Connected);
        let task = tokio::spawn(run_supervisor(
            socket,
            commands_rx,
            events_tx,
            shutdown_rx,
            settings,
        ));

        Ok(Self {
            sender: TransportSender { tx: commands_tx },
            events_rx,
            runtime: Some(Runtime { shutdown_tx, task }),
        })
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        self.sender.send(message).await
    }

    pub async fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        self.sender.send_audio(frame).await
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events_rx.recv().await
    }

    /// Closes the connection without reconnecting and waits for the
    /// supervisor to stop.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(true);
            runtime
                .task
                .await
                .map_err(|e| ParleyError::Other(format!("Transport task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(true);
            runtime.task.abort();
        }
    }
}

enum Outcome {
    Shutdown,
    Disconnected(String),
    AuthRequired(String),
}

async fn run_supervisor(
    mut socket: ClientSocket,
    mut commands: mpsc::Receiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    mut settings: ClientSettings,
) {
    'connection: loop {
        let outcome = run_connection(
            &mut socket,
            &mut commands,
            &events,
            &mut shutdown,
            settings.heartbeat_interval,
        )
        .await;

        match outcome {
            Outcome::Shutdown => break,
            Outcome::AuthRequired(message) => {
                settings.token = None;
                let _ = events.send(TransportEvent::AuthRequired { message });
                break;
            }
            Outcome::Disconnected(reason) => {
                tracing::warn!(%reason, "Connection lost");
                let _ = events.send(TransportEvent::Disconnected { reason });
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let Some(delay) = settings.reconnect.delay_for(attempt) else {
                tracing::warn!(attempts = attempt - 1, "Reconnect attempts exhausted");
                break 'connection;
            };
            let _ = events.send(TransportEvent::Reconnecting { attempt, delay });
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'connection;
                    }
                }
            }

            match open_socket(&settings.url, settings.token.as_deref()).await {
                Ok(reconnected) => {
                    socket = reconnected;
                    tracing::info!(attempt, "Reconnected");
                    let _ = events.send(TransportEvent::Connected);
                    continue 'connection;
                }
                Err(ParleyError::Authentication { message }) => {
                    settings.token = None;
                    let _ = events.send(TransportEvent::AuthRequired { message });
                    break 'connection;
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Reconnect failed");
                }
            }
        }
    }

    let _ = events.send(TransportEvent::Closed);
}

async fn run_connection(
    socket: &mut ClientSocket,
    commands: &mut mpsc::Receiver<Outgoing>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
    heartbeat_interval: Duration,
) -> Outcome {
    let mut heartbeat = time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                }
            }
            command = commands.recv() => {
                let frame = match command {
                    Some(Outgoing::Control(message)) => match message.to_json() {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode client message");
                            continue;
                        }
                    },
                    Some(Outgoing::Audio(bytes)) => Message::Binary(bytes),
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        return Outcome::Shutdown;
                    }
                };
                if let Err(e) = socket.send(frame).await {
                    return Outcome::Disconnected(format!("send failed: {}", e));
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = socket.send(Message::Ping(Vec::new())).await {
                    return Outcome::Disconnected(format!("heartbeat failed: {}", e));
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(ServerMessage::AuthRequired { message }) => {
                            let _ = socket.send(Message::Close(None)).await;
                            return Outcome::AuthRequired(message);
                        }
                        Ok(message) => {
                            let _ = events.send(TransportEvent::Message(message));
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed server message"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = socket.send(Message::Pong(payload)).await {
                            return Outcome::Disconnected(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Outcome::Disconnected("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Outcome::Disconnected(e.to_string()),
                    None => return Outcome::Disconnected("stream ended".to_string()),
                }
            }
        }
    }
}

async fn open_socket(url: &str, token: Option<&str>) -> Result<ClientSocket> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ParleyError::TransportConnection {
            message: format!("Invalid server URL {}: {}", url, e),
        })?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            ParleyError::TransportConnection {
                message: format!("Invalid token: {}", e),
            }
        })?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    connect_async(request)
        .await
        .map(|(socket, _)| socket)
        .map_err(map_connect_error)
}

fn map_connect_error(error: WsError) -> ParleyError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if matches!(status, 401 | 403) {
                ParleyError::Authentication {
                    message: format!("Server rejected credentials with status {}", status),
                }
            } else {
                ParleyError::TransportConnection {
                    message: format!("Handshake failed with status {}", status),
                }
            }
        }
        WsError::Io(e) => ParleyError::TransportConnection {
            message: e.to_string(),
        },
        other => ParleyError::TransportConnection {
            message: other.to_string(),
        },
    }
}
