//! Application entry points for the `serve` and `talk` commands.
//!
//! Wires configuration into the server, or into
//! capture → transport → playback for the client.

use crate::audio::activity::PlaybackActivity;
use crate::audio::capture_gate::CaptureGate;
use crate::audio::source::AudioSource;
use crate::audio::wav::{WavAudioSource, WavSink};
use crate::client::{ClientEvent, ClientStats, VoiceClient, VoiceClientConfig, bridge_capture};
use crate::config::Config;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::pipeline::capture::{CapturePipeline, CapturePipelineConfig};
use crate::playback::scheduler::PlaybackScheduler;
use crate::playback::timeline::{RealtimeRenderer, TimelineOutput};
use crate::session::engines::EngineRegistry;
use crate::transport::client::TransportClient;
use crate::transport::server::SessionServer;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Render period of the file/silent playback clock.
const RENDER_PERIOD: Duration = Duration::from_millis(10);

/// Builds the engine registry with the configured defaults.
///
/// An unknown id keeps the built-in engine and is logged.
pub fn engine_registry(config: &Config) -> EngineRegistry {
    let mut registry = EngineRegistry::builtin();
    if let Err(e) = registry.set_default_transcriber(&config.session.stt_engine) {
        tracing::warn!(error = %e, fallback = registry.default_transcriber_id(), "Keeping default transcriber");
    }
    if let Err(e) = registry.set_default_synthesizer(&config.session.tts_engine) {
        tracing::warn!(error = %e, fallback = registry.default_synthesizer_id(), "Keeping default synthesizer");
    }
    registry
}

/// Run the session server until Ctrl-C.
pub async fn run_serve(config: Config, quiet: bool) -> Result<()> {
    config.validate()?;
    let registry = engine_registry(&config);
    let server = SessionServer::bind(&config.server.listen, registry, config.server_settings()).await?;
    let handle = server.spawn()?;

    if !quiet {
        eprintln!("Listening on {}", handle.url("/session"));
        if config.server.token.is_some() {
            eprintln!("Clients must present a token");
        }
    }

    tokio::signal::ctrl_c().await?;
    if !quiet {
        eprintln!("Shutting down");
    }
    handle.shutdown().await
}

/// Options of the `talk` command that have no config file counterpart.
#[derive(Debug, Clone, Default)]
pub struct TalkOptions {
    pub wav: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub device: Option<String>,
}

/// Where played audio goes.
enum Speaker {
    Rendered(RealtimeRenderer),
    #[cfg(feature = "cpal-audio")]
    Device(crate::playback::device::CpalOutput),
}

impl Speaker {
    fn open(timeline: &TimelineOutput, options: &TalkOptions) -> Result<Self> {
        if let Some(path) = &options.output {
            let sink = WavSink::create(path, defaults::SAMPLE_RATE)?;
            return Ok(Speaker::Rendered(RealtimeRenderer::spawn(
                timeline.clone(),
                defaults::SAMPLE_RATE,
                RENDER_PERIOD,
                Some(sink),
            )?));
        }

        #[cfg(feature = "cpal-audio")]
        {
            let output =
                crate::playback::device::CpalOutput::start(timeline.clone(), options.device.as_deref())?;
            Ok(Speaker::Device(output))
        }

        #[cfg(not(feature = "cpal-audio"))]
        {
            tracing::info!("Built without audio devices, replies are not audible");
            Ok(Speaker::Rendered(RealtimeRenderer::spawn(
                timeline.clone(),
                defaults::SAMPLE_RATE,
                RENDER_PERIOD,
                None,
            )?))
        }
    }

    fn stop(self) -> Result<()> {
        match self {
            Speaker::Rendered(renderer) => {
                let samples = renderer.stop()?;
                tracing::debug!(samples, "Playback renderer stopped");
                Ok(())
            }
            #[cfg(feature = "cpal-audio")]
            Speaker::Device(output) => output.stop(),
        }
    }
}

fn open_source(options: &TalkOptions) -> Result<Box<dyn AudioSource>> {
    if let Some(path) = &options.wav {
        return Ok(Box::new(WavAudioSource::from_path(path)?));
    }

    #[cfg(feature = "cpal-audio")]
    {
        let source = crate::audio::capture::CpalAudioSource::new(options.device.as_deref())?;
        Ok(Box::new(source))
    }

    #[cfg(not(feature = "cpal-audio"))]
    {
        Err(ParleyError::AudioDeviceNotFound {
            device: "microphone support not compiled in, pass --wav".to_string(),
        })
    }
}

/// Talk to a session server: speech in, spoken replies out.
pub async fn run_talk(config: Config, options: TalkOptions, quiet: bool) -> Result<ClientStats> {
    config.validate()?;

    let activity = PlaybackActivity::new();
    let gate = CaptureGate::new(config.capture_config()).with_playback_activity(activity.clone());
    let source = open_source(&options)?;

    let timeline = TimelineOutput::new(defaults::SAMPLE_RATE);
    let speaker = Speaker::open(&timeline, &options)?;
    let (scheduler, playback_events) = PlaybackScheduler::new(timeline, config.playback_config());
    let scheduler = scheduler.with_activity(activity);

    let transport = TransportClient::connect(config.client_settings()).await?;

    let mut capture = CapturePipeline::new(CapturePipelineConfig::default()).start(source, gate)?;
    let captured = capture
        .take_events()
        .ok_or_else(|| ParleyError::InvalidState("capture events already taken".to_string()))?;

    let client_config = VoiceClientConfig {
        chat_mode: config.session.chat_mode,
        stt_engine: Some(config.session.stt_engine.clone()),
        tts_engine: Some(config.session.tts_engine.clone()),
        noise_reduction: config.session.noise_reduction,
        ..VoiceClientConfig::default()
    };
    let (client, mut events) = VoiceClient::new(transport, scheduler, playback_events, client_config);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !quiet {
                print_event(&event);
            }
        }
    });

    let result = client.run(bridge_capture(captured)).await;

    capture.stop();
    if let Err(e) = speaker.stop() {
        tracing::warn!(error = %e, "Failed to stop playback");
    }
    if printer.await.is_err() {
        tracing::warn!("Event printer panicked");
    }

    result
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected => eprintln!("[connected]"),
        ClientEvent::Transcript(text) => println!("you: {}", text),
        ClientEvent::AgentDelta(delta) => {
            print!("{}", delta);
            std::io::stdout().flush().ok();
        }
        ClientEvent::AgentMessage(message) => println!("agent: {}", message),
        ClientEvent::ReplyComplete => println!(),
        ClientEvent::BargeIn => eprintln!("[interrupted]"),
        ClientEvent::ServerError(message) => eprintln!("[error] {}", message),
        ClientEvent::AuthRequired(message) => eprintln!("[auth required] {}", message),
        ClientEvent::Reconnecting { attempt, delay } => {
            eprintln!("[reconnecting #{} in {:?}]", attempt, delay)
        }
        ClientEvent::Disconnected(reason) => eprintln!("[disconnected] {}", reason),
        ClientEvent::Playback(_) | ClientEvent::Closed => {}
    }
}
