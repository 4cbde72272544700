//! Realtime session provisioning.

pub mod factory;
pub mod types;

pub use factory::{
    HttpSessionFactory, MockSessionFactory, SessionFactory, create_session_with_retry,
    parse_provisioning,
};
pub use types::{Session, SessionContext, VoiceOptions};
