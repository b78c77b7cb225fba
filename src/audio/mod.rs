pub mod activity;
#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod capture_gate;
pub mod denoise;
pub mod pcm;
pub mod source;
pub mod vad;
pub mod wav;
