use crate::defaults;
use crate::error::VoiceError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub audio: AudioConfig,
    pub tools: ToolsConfig,
    pub detector: DetectorConfig,
    pub reconnect: BackoffConfig,
    pub retry: BackoffConfig,
}

/// Speech provider and session provisioning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub provision_url: String,
    pub realtime_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub locale: String,
    pub instructions: String,
    pub transcription_model: Option<String>,
    pub timeout_secs: u64,
}

/// Microphone capture constraints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub latency_ms: Option<u32>,
    pub frame_ms: u64,
}

/// Backend tool endpoints reachable by the assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tools without an explicit `url` are posted to `{base_url}/{name}`.
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub endpoints: Vec<ToolEndpointConfig>,
}

/// One tool exposed to the assistant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEndpointConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// Local closing-phrase detector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub enabled: bool,
    pub phrases: Vec<String>,
    pub max_tail_words: usize,
    pub cooldown_ms: u64,
    pub restart_delay_ms: u64,
    pub max_restarts: u32,
    /// End the session once the closing phrase is heard.
    pub end_session: bool,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            audio: AudioConfig::default(),
            tools: ToolsConfig::default(),
            detector: DetectorConfig::default(),
            reconnect: BackoffConfig {
                max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
                base_delay_ms: defaults::RECONNECT_BASE_DELAY_MS,
                max_delay_ms: defaults::RECONNECT_MAX_DELAY_MS,
            },
            retry: BackoffConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provision_url: defaults::PROVISION_URL.to_string(),
            realtime_url: defaults::REALTIME_URL.to_string(),
            api_key: None,
            model: defaults::DEFAULT_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
            locale: defaults::DEFAULT_LOCALE.to_string(),
            instructions: defaults::DEFAULT_INSTRUCTIONS.to_string(),
            transcription_model: Some(defaults::TRANSCRIPTION_MODEL.to_string()),
            timeout_secs: defaults::PROVISION_TIMEOUT_SECS,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            channel_count: defaults::CHANNEL_COUNT,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            latency_ms: None,
            frame_ms: defaults::FRAME_MS,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: defaults::TOOL_TIMEOUT_MS,
            endpoints: Vec::new(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: vec![defaults::CLOSING_PHRASE.to_string()],
            max_tail_words: defaults::MAX_TAIL_WORDS,
            cooldown_ms: defaults::DETECTOR_COOLDOWN_MS,
            restart_delay_ms: defaults::DETECTOR_RESTART_DELAY_MS,
            max_restarts: defaults::DETECTOR_MAX_RESTARTS,
            end_session: true,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
        }
    }
}

impl BackoffConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML or out-of-range values.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |key: &str, message: &str| VoiceError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.audio.sample_rate == 0 {
            return Err(invalid("audio.sample_rate", "must be positive"));
        }
        if !(1..=2).contains(&self.audio.channel_count) {
            return Err(invalid("audio.channel_count", "must be 1 or 2"));
        }
        if self.audio.frame_ms == 0 {
            return Err(invalid("audio.frame_ms", "must be positive"));
        }
        if self.tools.timeout_ms == 0 {
            return Err(invalid("tools.timeout_ms", "must be positive"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(invalid("provider.timeout_secs", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be at least 1"));
        }
        if self.detector.enabled && self.detector.phrases.iter().all(|p| p.trim().is_empty()) {
            return Err(invalid("detector.phrases", "needs at least one phrase"));
        }
        for endpoint in &self.tools.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(invalid("tools.endpoints.name", "must not be empty"));
            }
            if endpoint.url.is_none() && self.tools.base_url.is_none() {
                return Err(VoiceError::ConfigInvalidValue {
                    key: format!("tools.endpoints.{}", endpoint.name),
                    message: "needs a url or tools.base_url".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - KIOSK_VOICE_API_KEY → provider.api_key
    /// - KIOSK_VOICE_MODEL → provider.model
    /// - KIOSK_VOICE_VOICE → provider.voice
    /// - KIOSK_VOICE_LOCALE → provider.locale
    /// - KIOSK_VOICE_PROVISION_URL → provider.provision_url
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("KIOSK_VOICE_API_KEY")
            && !key.is_empty()
        {
            self.provider.api_key = Some(key);
        }

        if let Ok(model) = std::env::var("KIOSK_VOICE_MODEL")
            && !model.is_empty()
        {
            self.provider.model = model;
        }

        if let Ok(voice) = std::env::var("KIOSK_VOICE_VOICE")
            && !voice.is_empty()
        {
            self.provider.voice = voice;
        }

        if let Ok(locale) = std::env::var("KIOSK_VOICE_LOCALE")
            && !locale.is_empty()
        {
            self.provider.locale = locale;
        }

        if let Ok(url) = std::env::var("KIOSK_VOICE_PROVISION_URL")
            && !url.is_empty()
        {
            self.provider.provision_url = url;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/kiosk-voice/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("kiosk-voice")
            .join("config.toml")
    }
}
