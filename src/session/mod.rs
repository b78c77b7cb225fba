//! Conversation session: barge-in control, engines and per-connection state.

pub mod cancellation;
pub mod context;
pub mod engines;
pub mod handler;
pub mod state;

pub use cancellation::{BargeIn, CancellationController, Interruptible, PeerNotifier, ResponseState};
pub use context::{AudioContext, ContextTracker};
pub use engines::{
    ConversationTurn, EchoResponder, EngineRegistry, MockTranscriber, PlaceholderTranscriber,
    ResponseGenerator, ResponseRequest, Role, Transcriber,
};
pub use handler::{Outbound, SessionHandler};
pub use state::{ConnectionSession, SessionDefaults};
