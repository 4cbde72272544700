//! Event channel parsing and routing.

pub mod protocol;
pub mod router;
pub mod transcript;

pub use protocol::{ClientEvent, RealtimeEvent, SessionConfig, Speaker, parse_event};
pub use router::{EventRouter, EventSubscriber, RouterStats};
pub use transcript::{
    TranscriptAssembler, TranscriptEntry, TranscriptFragment, TranscriptHandle, TranscriptLog,
};
