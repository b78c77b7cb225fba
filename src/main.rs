use anyhow::Result;
use clap::Parser;
use parley::app::{TalkOptions, run_serve, run_talk};
use parley::cli::{Cli, Commands, ConfigAction};
use parley::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    parley::logging::init(cli.verbose);
    tracing::debug!(version = %parley::version_string(), "Starting");

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            listen,
            token,
            session,
        } => {
            session.apply(&mut config);
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if token.is_some() {
                config.server.token = token;
            }
            run_serve(config, cli.quiet).await?;
        }
        Commands::Talk {
            url,
            token,
            wav,
            output,
            device,
            session,
        } => {
            session.apply(&mut config);
            if let Some(url) = url {
                config.transport.url = url;
            }
            if token.is_some() {
                config.transport.token = token;
            }
            let device = device.or_else(|| config.capture.device.clone());
            let options = TalkOptions {
                wav,
                output,
                device,
            };
            let stats = run_talk(config, options, cli.quiet).await?;
            if !cli.quiet {
                eprintln!(
                    "Sent {} segment(s), played {} chunk(s), {} interruption(s)",
                    stats.segments_sent, stats.chunks_played, stats.barge_ins
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
            ConfigAction::Path => println!("{}", cli.config.unwrap_or_else(Config::default_path).display()),
        },
        #[cfg(feature = "cpal-audio")]
        Commands::Devices => list_audio_devices()?,
    }

    Ok(())
}

/// Loads the file (or defaults), then applies environment overrides.
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = parley::audio::capture::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }
    Ok(())
}
