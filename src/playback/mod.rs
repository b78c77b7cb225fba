#[cfg(feature = "cpal-audio")]
pub mod device;
pub mod output;
pub mod scheduler;
pub mod timeline;

pub use output::{AudioOutput, ManualClock, PlaybackItem, RecordingOutput};
pub use scheduler::{PlaybackConfig, PlaybackEvent, PlaybackScheduler};
pub use timeline::{RealtimeRenderer, TimelineOutput};
