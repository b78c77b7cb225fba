//! parley - spoken conversation over a WebSocket session
//!
//! Voice-gated capture, streamed reply synthesis cut into fixed-size chunks,
//! gapless playback and barge-in, on both ends of one duplex connection.

// Library code propagates errors instead of panicking
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod app;
pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod defaults;
pub mod error;
#[cfg(feature = "cli")]
pub mod logging;
pub mod pipeline;
pub mod playback;
pub mod session;
pub mod synthesis;
pub mod transport;

// Audio model
pub use audio::capture_gate::{CaptureConfig, CaptureEvent, CaptureGate};
pub use audio::pcm::{AudioFrame, SpeechSegment};
pub use audio::source::AudioSource;

// Reply path
pub use playback::scheduler::{PlaybackConfig, PlaybackEvent, PlaybackScheduler};
pub use synthesis::buffer::{SynthesisChunkBuffer, SynthesisConfig};
pub use synthesis::provider::SynthesisProvider;

// Session and transport
pub use client::{ClientEvent, VoiceClient, VoiceClientConfig};
pub use session::cancellation::CancellationController;
pub use session::engines::{EngineRegistry, ResponseGenerator, Transcriber};
pub use transport::{ClientMessage, ServerMessage, SessionServer, TransportClient, TransportEvent};

// Error handling
pub use error::{ParleyError, Result};

// Config
pub use config::Config;

// Station framework
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_appends_git_hash_when_known() {
        let ver = version_string();
        if option_env!("GIT_HASH").is_some_and(|h| !h.is_empty()) {
            assert!(ver.contains('+'), "expected '+<hash>', got: {}", ver);
        } else {
            assert_eq!(ver, env!("CARGO_PKG_VERSION"));
        }
    }
}
