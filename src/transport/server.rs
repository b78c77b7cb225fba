//! WebSocket session server.
//!
//! One task per connection reads frames into a [`SessionHandler`]; a second
//! task drains the connection's bounded outbound queue into the socket.

use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::session::engines::EngineRegistry;
use crate::session::handler::{Outbound, SessionHandler};
use crate::session::state::{ConnectionSession, SessionDefaults};
use crate::transport::protocol::ServerMessage;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, header::AUTHORIZATION};

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Token clients must present. `None` accepts everyone.
    pub token: Option<String>,
    pub session: SessionDefaults,
    pub outbound_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            token: None,
            session: SessionDefaults::default(),
            outbound_queue: defaults::OUTBOUND_QUEUE,
        }
    }
}

struct Shared {
    registry: Arc<EngineRegistry>,
    settings: ServerSettings,
}

pub struct SessionServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// A running server. Dropping it without [`ServerHandle::shutdown`] aborts
/// the accept loop.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<Result<()>>>,
}

impl SessionServer {
    pub async fn bind(
        addr: &str,
        registry: EngineRegistry,
        settings: ServerSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ParleyError::TransportConnection {
                message: format!("Failed to bind {}: {}", addr, e),
            })?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry: Arc::new(registry),
                settings,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop on a background task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServerHandle {
            addr,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Accepts connections until `shutdown` turns true, then waits for every
    /// connection to wind down.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Session server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&self.shared);
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(stream, peer, shared, shutdown).await {
                                    tracing::warn!(%peer, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        tracing::info!(open = connections.len(), "Session server shutting down");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL of the server for the given path.
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Stops accepting, closes every connection and waits for them.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ParleyError::Other(format!("Server task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let presented: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&presented);
    let expected = shared.settings.token.clone();

    let socket = accept_hdr_async(stream, move |request: &Request, response: Response| {
        let token = token_from_request(request);
        if let Some(expected) = &expected
            && token.as_deref() != Some(expected.as_str())
        {
            return Err(unauthorized());
        }
        *capture.lock().unwrap_or_else(|p| p.into_inner()) = token;
        Ok(response)
    })
    .await
    .map_err(|e| ParleyError::TransportConnection {
        message: format!("Handshake with {} failed: {}", peer, e),
    })?;

    let token = presented
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
    let (mut sink, mut frames) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(shared.settings.outbound_queue.max(1));

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!(error = %e, "Write failed, stopping writer");
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let session = ConnectionSession::new(Arc::clone(&shared.registry), shared.settings.session.clone())
        .with_token(token);
    tracing::info!(%peer, conversation = %session.conversation_id(), "Client connected");
    let mut handler = SessionHandler::new(session, Outbound::new(tx));
    let mut result = handler.greet().await;

    while result.is_ok() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = frames.next() => {
                result = match frame {
                    Some(Ok(Message::Text(text))) => handler.handle_text(&text).await,
                    Some(Ok(Message::Binary(bytes))) => handler.handle_audio(bytes).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(ParleyError::TransportConnection {
                        message: e.to_string(),
                    }),
                };
            }
        }
    }

    handler.close().await;
    if writer.await.is_err() {
        tracing::debug!(%peer, "Writer task aborted");
    }
    tracing::info!(%peer, "Client disconnected");

    match result {
        Err(ParleyError::TransportClosed) => Ok(()),
        other => other,
    }
}

/// Token from `Authorization: Bearer ...` or the `token` query parameter.
fn token_from_request(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.trim().to_string());
    }
    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("invalid or missing token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_bearer_header() {
        let req = request("/session", Some("Bearer secret"));
        assert_eq!(token_from_request(&req), Some("secret".to_string()));
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/session?lang=en&token=abc", None);
        assert_eq!(token_from_request(&req), Some("abc".to_string()));
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = request("/session?token=query", Some("Bearer header"));
        assert_eq!(token_from_request(&req), Some("header".to_string()));
    }

    #[test]
    fn test_missing_token() {
        assert_eq!(token_from_request(&request("/session", None)), None);
        assert_eq!(token_from_request(&request("/session?token=", None)), None);
        assert_eq!(
            token_from_request(&request("/session", Some("Basic abc"))),
            None
        );
    }

    #[test]
    fn test_unauthorized_response() {
        assert_eq!(unauthorized().status(), StatusCode::UNAUTHORIZED);
    }
}
