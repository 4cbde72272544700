//! kiosk-voice - Realtime voice sessions for gym kiosks
//!
//! Provisions a conversation with a cloud speech service, streams the kiosk
//! microphone to it, answers the assistant's function calls against backend
//! tools and ends the session when the member says goodbye.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
#[cfg(feature = "cli")]
pub mod output;
pub mod retry;
pub mod session;
pub mod tools;
pub mod transport;

// Seams (session → transport → events → tools)
pub use audio::recorder::{AudioSource, Microphone};
pub use detector::{PhraseMatcher, Recognizer};
pub use events::router::EventSubscriber;
pub use session::SessionFactory;
pub use tools::registry::ToolHandler;
pub use transport::peer::PeerTransport;

// Engine
pub use engine::{EngineConfig, SessionObserver, VoiceEngine, VoiceEngineBuilder};

// Error handling
pub use error::{Result, VoiceError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.0.1+abc1234"` when git hash is available, `"0.0.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
