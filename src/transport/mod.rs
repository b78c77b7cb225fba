//! Duplex session channel: JSON control messages and binary PCM over
//! WebSocket.

pub mod backoff;
pub mod client;
pub mod protocol;
pub mod server;

pub use backoff::ReconnectPolicy;
pub use client::{ClientSettings, TransportClient, TransportEvent, TransportSender};
pub use protocol::{ChatMode, ClientMessage, ServerMessage};
pub use server::{ServerHandle, ServerSettings, SessionServer};
