//! Error types for parley.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParleyError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Unknown {kind} engine '{id}'")]
    UnknownEngine { kind: String, id: String },

    // Audio errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    #[error("Audio output failed: {message}")]
    AudioOutput { message: String },

    #[error("Misaligned PCM buffer: {len} bytes is not a whole number of samples")]
    MisalignedPcm { len: usize },

    #[error("Denoiser failed: {message}")]
    Denoise { message: String },

    // Collaborator errors
    #[error("Transcription failed: {message}")]
    Transcription { message: String },

    #[error("Synthesis failed: {message}")]
    Synthesis { message: String },

    #[error("Synthesis provider timed out after {ms}ms")]
    SynthesisTimeout { ms: u64 },

    #[error("Response generation failed: {message}")]
    Generation { message: String },

    // Transport errors
    #[error("Transport connection failed: {message}")]
    TransportConnection { message: String },

    #[error("Transport closed")]
    TransportClosed,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl ParleyError {
    /// True for failures of a single provider call that the session survives.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ParleyError::Transcription { .. }
                | ParleyError::Synthesis { .. }
                | ParleyError::SynthesisTimeout { .. }
                | ParleyError::Generation { .. }
                | ParleyError::Denoise { .. }
        )
    }

    /// True when the failure means the credential was rejected.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ParleyError::Authentication { .. } => true,
            ParleyError::Transcription { message }
            | ParleyError::Synthesis { message }
            | ParleyError::Generation { message }
            | ParleyError::TransportConnection { message } => looks_like_auth_failure(message),
            _ => false,
        }
    }
}

/// Detects authentication failures reported only through message text or an
/// embedded HTTP status.
pub fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["401", "403", "unauthorized", "forbidden", "invalid token", "authentication"]
        .iter()
        .any(|needle| lower.contains(needle))
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = ParleyError::ConfigInvalidValue {
            key: "capture.positive_threshold".to_string(),
            message: "must be above the negative threshold".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for capture.positive_threshold: must be above the negative threshold"
        );
    }

    #[test]
    fn test_unknown_engine_display() {
        let error = ParleyError::UnknownEngine {
            kind: "synthesis".to_string(),
            id: "polly".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown synthesis engine 'polly'");
    }

    #[test]
    fn test_misaligned_pcm_display() {
        let error = ParleyError::MisalignedPcm { len: 3 };
        assert_eq!(
            error.to_string(),
            "Misaligned PCM buffer: 3 bytes is not a whole number of samples"
        );
    }

    #[test]
    fn test_synthesis_timeout_display() {
        let error = ParleyError::SynthesisTimeout { ms: 250 };
        assert_eq!(error.to_string(), "Synthesis provider timed out after 250ms");
    }

    #[test]
    fn test_provider_failures_are_recoverable() {
        assert!(
            ParleyError::Synthesis {
                message: "boom".to_string()
            }
            .is_recoverable()
        );
        assert!(ParleyError::SynthesisTimeout { ms: 1 }.is_recoverable());
        assert!(
            ParleyError::Transcription {
                message: "boom".to_string()
            }
            .is_recoverable()
        );
        assert!(!ParleyError::TransportClosed.is_recoverable());
        assert!(
            !ParleyError::Authentication {
                message: "nope".to_string()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_auth_failure_detected_from_message_content() {
        let error = ParleyError::Synthesis {
            message: "provider returned 401 Unauthorized".to_string(),
        };
        assert!(error.is_auth_failure());

        let error = ParleyError::Generation {
            message: "rate limited".to_string(),
        };
        assert!(!error.is_auth_failure());

        let error = ParleyError::Authentication {
            message: "expired".to_string(),
        };
        assert!(error.is_auth_failure());
    }

    #[test]
    fn test_looks_like_auth_failure_is_case_insensitive() {
        assert!(looks_like_auth_failure("FORBIDDEN"));
        assert!(looks_like_auth_failure("Invalid Token supplied"));
        assert!(!looks_like_auth_failure("connection reset by peer"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ParleyError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: ParleyError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: ParleyError = io_error.into();
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ParleyError>();
        assert_sync::<ParleyError>();
    }
}
