//! Default configuration constants for parley.
//!
//! Shared by the config layer and by the component constructors so that
//! `Default` impls and the TOML defaults never drift apart.

/// Audio sample rate in Hz for every PCM buffer on the wire.
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per PCM sample (signed 16-bit little-endian).
pub const SAMPLE_WIDTH: usize = 2;

// --- Capture gate ---

/// Samples per voice-activity window (32 ms at 16 kHz).
pub const VAD_WINDOW_SAMPLES: usize = 512;

/// Speech probability a window must reach to count as speech.
pub const POSITIVE_THRESHOLD: f32 = 0.65;

/// Speech probability below which a window counts as silence.
///
/// Windows between the two thresholds keep the current state.
pub const NEGATIVE_THRESHOLD: f32 = 0.45;

/// Consecutive positive windows needed to confirm speech start.
pub const START_WINDOWS: u32 = 3;

/// Consecutive negative windows needed to confirm speech end (~256 ms).
pub const REDEMPTION_WINDOWS: u32 = 8;

/// Windows kept before the first candidate window and prepended to a segment.
pub const PRE_ROLL_WINDOWS: usize = 3;

/// Minimum positive windows in a segment; shorter intervals are misfires.
pub const MIN_SPEECH_WINDOWS: u32 = 4;

/// Windows after which an open segment is closed without trailing silence (~30 s).
pub const MAX_SEGMENT_WINDOWS: usize = 940;

/// Window level (dBFS) at which the energy model reports probability 0.5.
pub const SPEECH_MIDPOINT_DB: f32 = -38.0;

/// Steepness of the energy model's logistic curve, in dB.
pub const SPEECH_SLOPE_DB: f32 = 3.0;

/// Minimum RMS energy for a finished segment to be kept.
pub const ENERGY_FLOOR: f32 = 0.006;

/// Floor multiplier while local playback is audible (speaker bleed).
pub const ECHO_FLOOR_MULTIPLIER: f32 = 3.0;

/// Frame size used by the noise gate denoiser (10 ms at 48 kHz).
pub const DENOISE_FRAME_SAMPLES: usize = 480;

// --- Synthesis ---

/// Fixed output chunk size in bytes (8192 samples).
pub const OUTPUT_CHUNK_BYTES: usize = 16 * 1024;

/// Accumulated characters after which the first chunk is triggered.
pub const FIRST_CHUNK_CHARS: usize = 60;

/// Minimum characters for a sentence-boundary trigger.
pub const MIN_CHUNK_CHARS: usize = 8;

/// Accumulated characters that force a trigger without punctuation.
pub const MAX_CHUNK_CHARS: usize = 250;

/// Time allowed for each awaited provider fragment.
pub const PROVIDER_TIMEOUT_MS: u64 = 10_000;

// --- Playback ---

/// Delay before the first buffer of an idle scheduler starts.
pub const LEAD_TIME_MS: u64 = 150;

/// Linear fade applied at both ends of every scheduled buffer.
pub const FADE_MS: u64 = 5;

/// How far ahead of the clock buffers are handed to the output.
pub const SCHEDULE_AHEAD_MS: u64 = 2000;

// --- Transport ---

/// Address the session server listens on.
pub const LISTEN_ADDR: &str = "127.0.0.1:8765";

/// URL the client connects to.
pub const SERVER_URL: &str = "ws://127.0.0.1:8765/session";

/// First reconnect delay; doubles per attempt.
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Upper bound for a single reconnect delay.
pub const RECONNECT_MAX_DELAY_MS: u64 = 10_000;

/// Reconnect attempts before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Interval between client pings.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 20;

/// Outbound frames buffered per connection before producers wait.
pub const OUTBOUND_QUEUE: usize = 64;

// --- Engines ---

/// Default transcription engine id.
pub const STT_ENGINE: &str = "placeholder";

/// Default synthesis engine id.
pub const TTS_ENGINE: &str = "tone";

/// Default response generator id.
pub const RESPONDER: &str = "echo";
