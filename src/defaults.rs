//! Default configuration constants for kiosk-voice.
//!
//! Shared by the configuration types and the components that fall back to
//! them when built without a config file.

/// Default capture sample rate in Hz.
///
/// Realtime speech providers exchange 16-bit PCM at 24kHz mono.
pub const SAMPLE_RATE: u32 = 24000;

/// Default number of capture channels.
pub const CHANNEL_COUNT: u16 = 1;

/// Duration of one captured frame pushed to the peer link, in milliseconds.
pub const FRAME_MS: u64 = 40;

/// Default realtime model identifier requested at provisioning time.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Default assistant voice.
pub const DEFAULT_VOICE: &str = "alloy";

/// Default conversation locale.
pub const DEFAULT_LOCALE: &str = "fr-FR";

/// Default assistant instructions.
///
/// `{member_name}` and `{locale}` are substituted per session.
pub const DEFAULT_INSTRUCTIONS: &str = "You are the front-desk assistant of this gym. \
Greet {member_name} warmly, answer questions about classes, opening hours and \
memberships, and use the available tools to act on their behalf. \
Speak in the language of locale {locale} and keep answers short.";

/// Placeholder used for `{member_name}` when no member is identified.
pub const ANONYMOUS_MEMBER: &str = "the member";

/// Model used by the provider to transcribe member speech.
pub const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Default provisioning endpoint.
pub const PROVISION_URL: &str = "https://api.openai.com/v1/realtime/sessions";

/// Default realtime event channel endpoint.
pub const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Timeout for one provisioning request, in seconds.
pub const PROVISION_TIMEOUT_SECS: u64 = 15;

/// Lifetime assumed for a session whose provisioning response carries no expiry.
pub const SESSION_TTL_SECS: i64 = 60;

/// Provisioning retry policy: attempts, base delay and delay ceiling.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 250;
pub const RETRY_MAX_DELAY_MS: u64 = 4000;

/// Reconnect policy used after a transport interruption.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 3;
pub const RECONNECT_BASE_DELAY_MS: u64 = 500;
pub const RECONNECT_MAX_DELAY_MS: u64 = 5000;

/// Upper bound on a single tool invocation, in milliseconds.
pub const TOOL_TIMEOUT_MS: u64 = 10_000;

/// Default closing phrase recognized by the local phrase detector.
pub const CLOSING_PHRASE: &str = "au revoir";

/// Extra words tolerated after a closing phrase ("au revoir merci").
pub const MAX_TAIL_WORDS: usize = 1;

/// Window during which a second closing phrase is ignored, in milliseconds.
pub const DETECTOR_COOLDOWN_MS: u64 = 3000;

/// Pause before the local recognizer is restarted after an error or end of stream.
pub const DETECTOR_RESTART_DELAY_MS: u64 = 300;

/// Consecutive recognizer restarts allowed before the detector gives up.
pub const DETECTOR_MAX_RESTARTS: u32 = 20;

/// Interval at which the input level is sampled for audio state updates.
pub const LEVEL_REFRESH_MS: u64 = 100;

/// Minimum input level change that produces a new audio state.
pub const LEVEL_EPSILON: f32 = 0.02;

/// Capacity of the captured-frame queue feeding the peer link.
pub const MEDIA_QUEUE_FRAMES: usize = 64;

/// Capacity of the inbound peer link message queue.
pub const LINK_QUEUE_MESSAGES: usize = 256;
