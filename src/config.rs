use crate::audio::capture_gate::CaptureConfig;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::playback::scheduler::PlaybackConfig;
use crate::session::state::SessionDefaults;
use crate::synthesis::buffer::SynthesisConfig;
use crate::synthesis::trigger::TriggerConfig;
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::client::ClientSettings;
use crate::transport::protocol::ChatMode;
use crate::transport::server::ServerSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
    pub capture: CaptureSection,
    pub synthesis: SynthesisSection,
    pub playback: PlaybackSection,
}

/// Session server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub outbound_queue: usize,
}

/// Client connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

/// Engine selection and conversation mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub stt_engine: String,
    pub tts_engine: String,
    pub chat_mode: ChatMode,
    pub noise_reduction: bool,
}

/// Voice gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub positive_threshold: f32,
    pub negative_threshold: f32,
    pub start_windows: u32,
    pub redemption_windows: u32,
    pub pre_roll_windows: usize,
    pub min_speech_windows: u32,
    pub max_segment_windows: usize,
    pub energy_floor: f32,
    pub echo_floor_multiplier: f32,
}

/// Reply chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisSection {
    pub chunk_bytes: usize,
    pub first_chunk_chars: usize,
    pub min_chunk_chars: usize,
    pub max_chunk_chars: usize,
    pub provider_timeout_ms: u64,
}

/// Local playback configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub lead_time_ms: u64,
    pub fade_ms: u64,
    pub schedule_ahead_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::LISTEN_ADDR.to_string(),
            token: None,
            outbound_queue: defaults::OUTBOUND_QUEUE,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: defaults::SERVER_URL.to_string(),
            token: None,
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            reconnect_base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
            reconnect_max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stt_engine: defaults::STT_ENGINE.to_string(),
            tts_engine: defaults::TTS_ENGINE.to_string(),
            chat_mode: ChatMode::default(),
            noise_reduction: false,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            device: None,
            positive_threshold: defaults::POSITIVE_THRESHOLD,
            negative_threshold: defaults::NEGATIVE_THRESHOLD,
            start_windows: defaults::START_WINDOWS,
            redemption_windows: defaults::REDEMPTION_WINDOWS,
            pre_roll_windows: defaults::PRE_ROLL_WINDOWS,
            min_speech_windows: defaults::MIN_SPEECH_WINDOWS,
            max_segment_windows: defaults::MAX_SEGMENT_WINDOWS,
            energy_floor: defaults::ENERGY_FLOOR,
            echo_floor_multiplier: defaults::ECHO_FLOOR_MULTIPLIER,
        }
    }
}

impl Default for SynthesisSection {
    fn default() -> Self {
        Self {
            chunk_bytes: defaults::OUTPUT_CHUNK_BYTES,
            first_chunk_chars: defaults::FIRST_CHUNK_CHARS,
            min_chunk_chars: defaults::MIN_CHUNK_CHARS,
            max_chunk_chars: defaults::MAX_CHUNK_CHARS,
            provider_timeout_ms: defaults::PROVIDER_TIMEOUT_MS,
        }
    }
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            device: None,
            lead_time_ms: defaults::LEAD_TIME_MS,
            fade_ms: defaults::FADE_MS,
            schedule_ahead_ms: defaults::SCHEDULE_AHEAD_MS,
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ParleyError {
    ParleyError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values; invalid TOML is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PARLEY_LISTEN → server.listen
    /// - PARLEY_URL → transport.url
    /// - PARLEY_TOKEN → server.token and transport.token
    /// - PARLEY_STT_ENGINE → session.stt_engine
    /// - PARLEY_TTS_ENGINE → session.tts_engine
    /// - PARLEY_CHAT_MODE → session.chat_mode
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(listen) = std::env::var("PARLEY_LISTEN")
            && !listen.is_empty()
        {
            self.server.listen = listen;
        }

        if let Ok(url) = std::env::var("PARLEY_URL")
            && !url.is_empty()
        {
            self.transport.url = url;
        }

        if let Ok(token) = std::env::var("PARLEY_TOKEN")
            && !token.is_empty()
        {
            self.server.token = Some(token.clone());
            self.transport.token = Some(token);
        }

        if let Ok(engine) = std::env::var("PARLEY_STT_ENGINE")
            && !engine.is_empty()
        {
            self.session.stt_engine = engine;
        }

        if let Ok(engine) = std::env::var("PARLEY_TTS_ENGINE")
            && !engine.is_empty()
        {
            self.session.tts_engine = engine;
        }

        if let Ok(mode) = std::env::var("PARLEY_CHAT_MODE")
            && !mode.is_empty()
        {
            match mode.parse() {
                Ok(mode) => self.session.chat_mode = mode,
                Err(e) => tracing::warn!(error = %e, "Ignoring PARLEY_CHAT_MODE"),
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/parley/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
            .join("config.toml")
    }

    /// Rejects values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(invalid(
                "server.listen",
                format!("'{}' is not a socket address", self.server.listen),
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(invalid("server.outbound_queue", "must be at least 1"));
        }
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            return Err(invalid(
                "transport.url",
                format!("'{}' is not a ws:// or wss:// URL", self.transport.url),
            ));
        }
        if self.transport.heartbeat_interval_secs == 0 {
            return Err(invalid("transport.heartbeat_interval_secs", "must be positive"));
        }
        if self.transport.reconnect_base_delay_ms == 0 {
            return Err(invalid("transport.reconnect_base_delay_ms", "must be positive"));
        }
        if self.transport.reconnect_max_delay_ms < self.transport.reconnect_base_delay_ms {
            return Err(invalid(
                "transport.reconnect_max_delay_ms",
                "must not be below the base delay",
            ));
        }

        let capture = &self.capture;
        for (key, value) in [
            ("capture.positive_threshold", capture.positive_threshold),
            ("capture.negative_threshold", capture.negative_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, format!("{} is outside 0..=1", value)));
            }
        }
        if capture.negative_threshold > capture.positive_threshold {
            return Err(invalid(
                "capture.negative_threshold",
                "must not exceed capture.positive_threshold",
            ));
        }
        if capture.start_windows == 0 || capture.redemption_windows == 0 {
            return Err(invalid(
                "capture.start_windows",
                "start and redemption windows must be positive",
            ));
        }
        if capture.max_segment_windows < capture.min_speech_windows as usize {
            return Err(invalid(
                "capture.max_segment_windows",
                "must be at least capture.min_speech_windows",
            ));
        }
        if capture.energy_floor < 0.0 || capture.echo_floor_multiplier < 1.0 {
            return Err(invalid(
                "capture.energy_floor",
                "floor must be non-negative and the echo multiplier at least 1",
            ));
        }

        let synthesis = &self.synthesis;
        if synthesis.chunk_bytes == 0 || synthesis.chunk_bytes % defaults::SAMPLE_WIDTH != 0 {
            return Err(invalid(
                "synthesis.chunk_bytes",
                format!(
                    "{} is not a positive multiple of {}",
                    synthesis.chunk_bytes,
                    defaults::SAMPLE_WIDTH
                ),
            ));
        }
        if synthesis.min_chunk_chars == 0 || synthesis.min_chunk_chars > synthesis.max_chunk_chars {
            return Err(invalid(
                "synthesis.min_chunk_chars",
                "must be positive and not exceed synthesis.max_chunk_chars",
            ));
        }
        if synthesis.provider_timeout_ms == 0 {
            return Err(invalid("synthesis.provider_timeout_ms", "must be positive"));
        }

        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ParleyError::Other(e.to_string()))
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let c = &self.capture;
        CaptureConfig {
            positive_threshold: c.positive_threshold,
            negative_threshold: c.negative_threshold,
            start_windows: c.start_windows,
            redemption_windows: c.redemption_windows,
            pre_roll_windows: c.pre_roll_windows,
            min_speech_windows: c.min_speech_windows,
            max_segment_windows: c.max_segment_windows,
            energy_floor: c.energy_floor,
            echo_floor_multiplier: c.echo_floor_multiplier,
            ..CaptureConfig::default()
        }
    }

    pub fn synthesis_config(&self) -> SynthesisConfig {
        let s = &self.synthesis;
        SynthesisConfig {
            chunk_bytes: s.chunk_bytes,
            trigger: TriggerConfig {
                first_chunk_chars: s.first_chunk_chars,
                min_chunk_chars: s.min_chunk_chars,
                max_chunk_chars: s.max_chunk_chars,
            },
            provider_timeout: Duration::from_millis(s.provider_timeout_ms),
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: defaults::SAMPLE_RATE,
            lead_time: Duration::from_millis(self.playback.lead_time_ms),
            fade: Duration::from_millis(self.playback.fade_ms),
            schedule_ahead: Duration::from_millis(self.playback.schedule_ahead_ms),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.transport.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.transport.reconnect_max_delay_ms),
            max_attempts: self.transport.reconnect_max_attempts,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            token: self.server.token.clone(),
            session: SessionDefaults {
                chat_mode: self.session.chat_mode,
                noise_reduction: self.session.noise_reduction,
                synthesis: self.synthesis_config(),
            },
            outbound_queue: self.server.outbound_queue,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            url: self.transport.url.clone(),
            token: self.transport.token.clone(),
            heartbeat_interval: Duration::from_secs(self.transport.heartbeat_interval_secs),
            reconnect: self.reconnect_policy(),
            ..ClientSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Serializes tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: only used with ENV_LOCK held.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_parley_env() {
        for key in [
            "PARLEY_LISTEN",
            "PARLEY_URL",
            "PARLEY_TOKEN",
            "PARLEY_STT_ENGINE",
            "PARLEY_TTS_ENGINE",
            "PARLEY_CHAT_MODE",
        ] {
            remove_env(key);
        }
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.server.listen, "127.0.0.1:8765");
        assert_eq!(config.server.token, None);
        assert_eq!(config.transport.url, "ws://127.0.0.1:8765/session");
        assert_eq!(config.session.stt_engine, "placeholder");
        assert_eq!(config.session.tts_engine, "tone");
        assert_eq!(config.session.chat_mode, ChatMode::Stream);
        assert_eq!(config.synthesis.chunk_bytes, 16 * 1024);
        assert_eq!(config.playback.lead_time_ms, defaults::LEAD_TIME_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let toml_content = r#"
            [server]
            listen = "0.0.0.0:9000"
            token = "secret"

            [session]
            tts_engine = "tone"
            chat_mode = "single"
            noise_reduction = true

            [synthesis]
            chunk_bytes = 4096
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.session.chat_mode, ChatMode::Single);
        assert!(config.session.noise_reduction);
        assert_eq!(config.synthesis.chunk_bytes, 4096);
        // Untouched fields keep defaults
        assert_eq!(config.synthesis.max_chunk_chars, defaults::MAX_CHUNK_CHARS);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[server\nlisten = \"broken").unwrap();
        assert!(Config::load(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_reports_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[session\n").unwrap();
        let err = Config::load_or_default(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_URL", "ws://example.test/session");
        set_env("PARLEY_TOKEN", "abc");
        set_env("PARLEY_CHAT_MODE", "single");
        set_env("PARLEY_STT_ENGINE", "");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.transport.url, "ws://example.test/session");
        assert_eq!(config.transport.token.as_deref(), Some("abc"));
        assert_eq!(config.server.token.as_deref(), Some("abc"));
        assert_eq!(config.session.chat_mode, ChatMode::Single);
        // Empty string does not override
        assert_eq!(config.session.stt_engine, "placeholder");

        clear_parley_env();
    }

    #[test]
    fn test_env_unknown_chat_mode_is_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_parley_env();

        set_env("PARLEY_CHAT_MODE", "telepathy");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.session.chat_mode, ChatMode::Stream);

        clear_parley_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.synthesis.chunk_bytes = 1001;
        assert!(matches!(
            config.validate(),
            Err(ParleyError::ConfigInvalidValue { key, .. }) if key == "synthesis.chunk_bytes"
        ));

        let mut config = Config::default();
        config.capture.negative_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.max_segment_windows = 2;
        assert!(matches!(
            config.validate(),
            Err(ParleyError::ConfigInvalidValue { key, .. }) if key == "capture.max_segment_windows"
        ));

        let mut config = Config::default();
        config.transport.url = "http://localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.listen = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_path_ends_in_parley_config() {
        let path = Config::default_path();
        assert!(path.ends_with("parley/config.toml"));
    }

    #[test]
    fn test_toml_output_round_trips() {
        let mut config = Config::default();
        config.session.chat_mode = ChatMode::Single;
        let text = config.to_toml().unwrap();
        assert!(text.contains("chat_mode = \"single\""));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_component_configs_follow_sections() {
        let mut config = Config::default();
        config.transport.reconnect_base_delay_ms = 100;
        config.synthesis.min_chunk_chars = 12;
        config.capture.start_windows = 5;
        config.capture.max_segment_windows = 300;

        assert_eq!(config.reconnect_policy().base_delay, Duration::from_millis(100));
        assert_eq!(config.synthesis_config().trigger.min_chunk_chars, 12);
        assert_eq!(config.capture_config().start_windows, 5);
        assert_eq!(config.capture_config().max_segment_windows, 300);
        assert_eq!(
            config.server_settings().session.synthesis.chunk_bytes,
            defaults::OUTPUT_CHUNK_BYTES
        );
        assert_eq!(config.client_settings().url, defaults::SERVER_URL);
    }
}
