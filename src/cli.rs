//! Command-line interface for kiosk-voice
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Realtime voice sessions for gym kiosks
#[derive(Parser, Debug)]
#[command(
    name = "kiosk-voice",
    version,
    about = "Realtime voice sessions for gym kiosks"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: level meter + partial transcripts, -vv: full diagnostics)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Member and kiosk identity sent to the provisioning endpoint
#[derive(clap::Args, Debug, Clone)]
pub struct SessionArgs {
    /// Tenant (gym) identifier
    #[arg(long, value_name = "ID")]
    pub tenant: String,

    /// Kiosk identifier
    #[arg(long, value_name = "ID")]
    pub kiosk: String,

    /// Member identifier, when a member is signed in
    #[arg(long, value_name = "ID")]
    pub member: Option<String>,

    /// Member display name used in the greeting
    #[arg(long, value_name = "NAME", requires = "member")]
    pub member_name: Option<String>,
}

/// Parse a duration such as `30s`, `5m` or `1h30m`. Bare numbers are seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a voice session and follow it until it ends or Ctrl-C
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Audio input device (default: system default)
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Read microphone audio from a WAV file instead of a device
        #[arg(long, value_name = "FILE", conflicts_with = "device")]
        wav: Option<PathBuf>,

        /// Do not play assistant audio
        #[arg(long)]
        mute: bool,

        /// End the session after this long. Examples: 90s, 5m
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        max_duration: Option<Duration>,

        /// Keep the session open after the closing phrase
        #[arg(long)]
        keep_open: bool,
    },

    /// Provision a session and print it as JSON
    Provision {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// List available audio input devices
    #[cfg(feature = "cpal-audio")]
    Devices,

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration as TOML
    Show,
}
