use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use kiosk_voice::audio::output::{AudioOutput, NullOutput};
use kiosk_voice::audio::recorder::Microphone;
use kiosk_voice::audio::wav::WavMicrophone;
use kiosk_voice::cli::{Cli, Commands, ConfigAction, SessionArgs};
use kiosk_voice::config::Config;
use kiosk_voice::engine::{EngineConfig, NoopObserver, VoiceEngine, VoiceEngineBuilder};
use kiosk_voice::output::TerminalObserver;
use kiosk_voice::session::{HttpSessionFactory, SessionContext, SessionFactory, VoiceOptions};
use kiosk_voice::tools::ToolRegistry;
use kiosk_voice::transport::{ConnectionState, WebSocketTransport};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kiosk_voice::logging::init(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Run {
            session,
            device,
            wav,
            mute,
            max_duration,
            keep_open,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = RunOptions {
                device,
                wav,
                mute,
                max_duration,
                keep_open,
                quiet: cli.quiet,
                verbose: cli.verbose,
            };
            run_session(config, session, options).await?;
        }
        Commands::Provision { session } => {
            let config = load_config(cli.config.as_deref())?;
            provision(&config, session).await?;
        }
        #[cfg(feature = "cpal-audio")]
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "kiosk-voice",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/kiosk-voice/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// List available audio input devices.
#[cfg(feature = "cpal-audio")]
fn list_audio_devices() -> Result<()> {
    let devices = kiosk_voice::audio::capture::list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx.dimmed(), device);
    }

    Ok(())
}

fn session_context(config: &Config, args: SessionArgs) -> SessionContext {
    let context = SessionContext::new(args.tenant, args.kiosk)
        .with_options(VoiceOptions::from_config(&config.provider));
    match args.member {
        Some(member) => context.with_member(member, args.member_name),
        None => context,
    }
}

struct RunOptions {
    device: Option<String>,
    wav: Option<PathBuf>,
    mute: bool,
    max_duration: Option<Duration>,
    keep_open: bool,
    quiet: bool,
    verbose: u8,
}

#[cfg(feature = "cpal-audio")]
fn device_microphone(config: &Config, device: Option<String>) -> Result<Arc<dyn Microphone>> {
    let device = device.or_else(|| config.audio.device.clone());
    Ok(Arc::new(kiosk_voice::audio::capture::CpalMicrophone::new(device)))
}

#[cfg(not(feature = "cpal-audio"))]
fn device_microphone(_config: &Config, _device: Option<String>) -> Result<Arc<dyn Microphone>> {
    anyhow::bail!("Built without microphone support; use --wav <FILE>")
}

#[cfg(feature = "cpal-audio")]
fn device_speaker(config: &Config) -> Option<Box<dyn AudioOutput>> {
    match kiosk_voice::audio::playback::CpalPlayback::new(config.audio.sample_rate) {
        Ok(playback) => Some(Box::new(playback)),
        Err(e) => {
            eprintln!("{} {} (continuing muted)", "warning:".yellow(), e);
            None
        }
    }
}

#[cfg(not(feature = "cpal-audio"))]
fn device_speaker(_config: &Config) -> Option<Box<dyn AudioOutput>> {
    None
}

fn microphone(config: &Config, options: &RunOptions) -> Result<Arc<dyn Microphone>> {
    match &options.wav {
        Some(path) => Ok(Arc::new(WavMicrophone::new(path.clone()))),
        None => device_microphone(config, options.device.clone()),
    }
}

fn speaker(config: &Config, mute: bool) -> Box<dyn AudioOutput> {
    if mute {
        return Box::new(NullOutput);
    }
    device_speaker(config).unwrap_or_else(|| Box::new(NullOutput))
}

/// Run one session until it ends, the time limit passes, or Ctrl-C.
async fn run_session(config: Config, args: SessionArgs, options: RunOptions) -> Result<()> {
    let factory: Arc<dyn SessionFactory> = Arc::new(HttpSessionFactory::from_config(&config.provider)?);
    let transport = Arc::new(WebSocketTransport::from_config(&config.provider));
    let tools = ToolRegistry::from_config(&config.tools)?;

    let mut engine_config = EngineConfig::from_config(&config);
    engine_config.detector.end_session = !options.keep_open;

    let builder: VoiceEngineBuilder =
        VoiceEngine::builder(factory, transport, microphone(&config, &options)?)
            .with_config(engine_config)
            .with_output(speaker(&config, options.mute))
            .with_tools(tools)
            .with_remote_transcript_detection();
    let builder = if options.quiet {
        builder.with_observer(NoopObserver)
    } else {
        builder.with_observer(TerminalObserver::new(options.verbose > 0))
    };
    let engine = builder.spawn();

    let context = session_context(&config, args);
    let session_id = engine.start_session(context).await?;
    if engine.set_listening(true).await? {
        tracing::debug!(session_id = %session_id, "Listening");
    }

    let deadline = async {
        match options.max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    let mut state = engine.subscribe_state();
    let ended = state.wait_for(|s| matches!(s, ConnectionState::Closed | ConnectionState::Error));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, ending session");
        }
        _ = deadline => {
            tracing::info!("Time limit reached, ending session");
        }
        _ = ended => {}
    }

    engine.stop_session().await?;
    engine.shutdown().await?;
    Ok(())
}

/// Create a session and print it without connecting.
async fn provision(config: &Config, args: SessionArgs) -> Result<()> {
    let factory = HttpSessionFactory::from_config(&config.provider)?;
    let session = factory.create_session(&session_context(config, args)).await?;

    let printed = serde_json::json!({
        "session_id": session.session_id,
        "model": session.model,
        "voice": session.voice,
        "expires_at": session.expires_at.to_rfc3339(),
        "instructions": session.context.rendered_instructions(),
    });
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(())
}

fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Path => {
            let marker = if config_path.exists() {
                String::new()
            } else {
                format!(" {}", "(not found, using defaults)".dimmed())
            };
            println!("{}{}", config_path.display(), marker);
        }
        ConfigAction::Show => {
            let mut config = Config::load_or_default(&config_path)?.with_env_overrides();
            if config.provider.api_key.is_some() {
                config.provider.api_key = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
