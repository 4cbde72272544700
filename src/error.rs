//! Error types for kiosk-voice.

use std::fmt;
use thiserror::Error;

/// Why a session credential could not be obtained or used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    /// The provisioning endpoint refused the request (bad upstream key, non-2xx).
    Rejected,
    /// The request never got an answer (connect error, timeout).
    Transient,
    /// The endpoint answered but the body is unusable.
    Malformed,
    /// The session expired before it could be used.
    Expired,
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CredentialFailure::Rejected => "rejected",
            CredentialFailure::Transient => "transient",
            CredentialFailure::Malformed => "malformed",
            CredentialFailure::Expired => "expired",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum VoiceError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Session provisioning
    #[error("Session credential {kind}: {message}")]
    Credential {
        kind: CredentialFailure,
        message: String,
    },

    // Microphone
    #[error("Audio device error: {message}")]
    Device { message: String },

    #[error("Audio device busy: {device} is already held by this engine")]
    DeviceBusy { device: String },

    // Peer link
    #[error("Connection negotiation failed: {message}")]
    Negotiation { message: String },

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Transport interrupted: {message}")]
    TransportInterruption { message: String },

    // Function calls
    #[error("Tool '{tool}' failed: {message}")]
    ToolDispatch { tool: String, message: String },

    // Event channel
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Fatal errors end the session: resources are released and the
    /// connection ends in `closed`.
    pub fn is_fatal(&self) -> bool {
        match self {
            VoiceError::Credential { kind, .. } => *kind != CredentialFailure::Transient,
            VoiceError::Device { .. } | VoiceError::DeviceBusy { .. } => true,
            _ => false,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VoiceError::Credential {
                kind: CredentialFailure::Transient,
                ..
            } | VoiceError::Negotiation { .. }
                | VoiceError::TransportInterruption { .. }
        )
    }

    pub(crate) fn credential(kind: CredentialFailure, message: impl Into<String>) -> Self {
        VoiceError::Credential {
            kind,
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoiceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoiceError::ConfigInvalidValue {
            key: "audio.sample_rate".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for audio.sample_rate: must be positive"
        );
    }

    #[test]
    fn test_credential_display_includes_kind() {
        let error = VoiceError::credential(CredentialFailure::Rejected, "status 401");
        assert_eq!(error.to_string(), "Session credential rejected: status 401");
    }

    #[test]
    fn test_device_busy_display() {
        let error = VoiceError::DeviceBusy {
            device: "default".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Audio device busy: default is already held by this engine"
        );
    }

    #[test]
    fn test_tool_dispatch_display() {
        let error = VoiceError::ToolDispatch {
            tool: "book_class".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(error.to_string(), "Tool 'book_class' failed: timed out");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(VoiceError::credential(CredentialFailure::Rejected, "x").is_fatal());
        assert!(VoiceError::credential(CredentialFailure::Malformed, "x").is_fatal());
        assert!(VoiceError::credential(CredentialFailure::Expired, "x").is_fatal());
        assert!(!VoiceError::credential(CredentialFailure::Transient, "x").is_fatal());
        assert!(
            VoiceError::Device {
                message: "permission denied".to_string()
            }
            .is_fatal()
        );
        assert!(
            !VoiceError::Negotiation {
                message: "x".to_string()
            }
            .is_fatal()
        );
        assert!(
            !VoiceError::ToolDispatch {
                tool: "t".to_string(),
                message: "x".to_string()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(VoiceError::credential(CredentialFailure::Transient, "x").is_retryable());
        assert!(
            VoiceError::TransportInterruption {
                message: "reset".to_string()
            }
            .is_retryable()
        );
        assert!(!VoiceError::credential(CredentialFailure::Rejected, "x").is_retryable());
        assert!(!VoiceError::Cancelled.is_retryable());
        assert!(
            !VoiceError::Protocol {
                message: "bad json".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoiceError = io_error.into();
        match error {
            VoiceError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_error = toml::from_str::<toml::Value>("invalid = [").unwrap_err();
        let error: VoiceError = toml_error.into();
        assert!(error.to_string().starts_with("Configuration error:"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<u32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
