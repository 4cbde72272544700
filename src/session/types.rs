use crate::config::ProviderConfig;
use crate::defaults;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Voice options requested for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceOptions {
    pub model: String,
    pub voice: String,
    pub locale: String,
    /// Instruction template. `{member_name}` and `{locale}` are substituted.
    pub instructions: String,
}

impl VoiceOptions {
    pub fn from_config(provider: &ProviderConfig) -> Self {
        Self {
            model: provider.model.clone(),
            voice: provider.voice.clone(),
            locale: provider.locale.clone(),
            instructions: provider.instructions.clone(),
        }
    }
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

/// Who is talking to the kiosk, and how the assistant should sound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub tenant_id: String,
    pub kiosk_id: String,
    pub member_id: Option<String>,
    pub member_name: Option<String>,
    pub options: VoiceOptions,
}

impl SessionContext {
    pub fn new(tenant_id: impl Into<String>, kiosk_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            kiosk_id: kiosk_id.into(),
            member_id: None,
            member_name: None,
            options: VoiceOptions::default(),
        }
    }

    pub fn with_member(mut self, member_id: impl Into<String>, member_name: Option<String>) -> Self {
        self.member_id = Some(member_id.into());
        self.member_name = member_name;
        self
    }

    pub fn with_options(mut self, options: VoiceOptions) -> Self {
        self.options = options;
        self
    }

    /// Instructions with the member placeholders filled in.
    pub fn rendered_instructions(&self) -> String {
        let name = self
            .member_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(defaults::ANONYMOUS_MEMBER);
        self.options
            .instructions
            .replace("{member_name}", name)
            .replace("{locale}", &self.options.locale)
    }
}

/// A provisioned realtime conversation.
///
/// Owned by the transport client from `connect` until disconnect.
#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub ephemeral_credential: String,
    pub model: String,
    pub voice: String,
    pub expires_at: DateTime<Utc>,
    pub context: SessionContext,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

// The credential never reaches logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("ephemeral_credential", &"<redacted>")
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("expires_at", &self.expires_at)
            .field("context", &self.context)
            .finish()
    }
}
