//! Error types and reporting for capture stations.

use crate::error::ParleyError;
use std::fmt;

/// Errors a station can return from one processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    /// Skip this input and keep going.
    Recoverable(String),
    /// Stop the station.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

impl From<ParleyError> for StationError {
    fn from(error: ParleyError) -> Self {
        if error.is_recoverable() {
            StationError::Recoverable(error.to_string())
        } else {
            StationError::Fatal(error.to_string())
        }
    }
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Reports station errors through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(msg) => tracing::warn!(station, "{}", msg),
            StationError::Fatal(msg) => tracing::error!(station, "{}", msg),
        }
    }
}
