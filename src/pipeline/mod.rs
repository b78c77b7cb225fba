//! Threaded capture pipeline.
//!
//! Each station runs on its own thread, connected by bounded crossbeam
//! channels for backpressure.

pub mod capture;
pub mod error;
pub mod station;

pub use capture::{CaptureHandle, CapturePipeline, CapturePipelineConfig, CaptureStation};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use station::{Station, StationRunner};
