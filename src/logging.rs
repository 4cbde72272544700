//! Subscriber setup for the binary. Library code only emits `tracing` events.

use tracing_subscriber::EnvFilter;

/// Map `-v` occurrences to a default filter directive.
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "kiosk_voice=error";
    }
    match verbosity {
        0 => "kiosk_voice=info",
        1 => "kiosk_voice=debug",
        _ => "kiosk_voice=trace,tokio_tungstenite=debug",
    }
}

/// Install a stderr subscriber. `RUST_LOG` wins over the verbosity flags.
pub fn init(verbosity: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity > 1)
        .try_init();

    if let Err(e) = result {
        eprintln!("kiosk-voice: logging already initialised: {}", e);
    }
}
