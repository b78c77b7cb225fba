//! Command-line interface for parley
//!
//! Provides argument parsing using clap derive macros.

use crate::config::Config;
use crate::transport::protocol::ChatMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Spoken conversation over a WebSocket session
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Spoken conversation over a WebSocket session")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress conversation output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Engine and mode flags shared by `serve` and `talk`
#[derive(clap::Args, Debug, Default, Clone)]
pub struct SessionArgs {
    /// Transcription engine id
    #[arg(long, value_name = "ID")]
    pub stt_engine: Option<String>,

    /// Synthesis engine id
    #[arg(long, value_name = "ID")]
    pub tts_engine: Option<String>,

    /// Reply delivery: single or stream
    #[arg(long, value_name = "MODE")]
    pub chat_mode: Option<ChatMode>,

    /// Denoise speech before transcription
    #[arg(long)]
    pub noise_reduction: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the session server
    Serve {
        /// Address to listen on (e.g. 127.0.0.1:8765)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Token clients must present
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Talk to a session server
    Talk {
        /// Server URL (e.g. ws://127.0.0.1:8765/session)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Token presented to the server
        #[arg(long, value_name = "TOKEN")]
        token: Option<String>,

        /// Read speech from a WAV file instead of the microphone
        #[arg(long, value_name = "PATH")]
        wav: Option<PathBuf>,

        /// Write the played reply audio to a WAV file
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Audio device for capture and playback
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List available audio input devices
    #[cfg(feature = "cpal-audio")]
    Devices,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

impl SessionArgs {
    /// Flags win over file and environment.
    pub fn apply(&self, config: &mut Config) {
        if let Some(engine) = &self.stt_engine {
            config.session.stt_engine = engine.clone();
        }
        if let Some(engine) = &self.tts_engine {
            config.session.tts_engine = engine.clone();
        }
        if let Some(mode) = self.chat_mode {
            config.session.chat_mode = mode;
        }
        if self.noise_reduction {
            config.session.noise_reduction = true;
        }
    }
}
