//! Local end-of-conversation phrase detection.

pub mod matcher;
pub mod phrase_detector;
pub mod recognizer;

pub use matcher::{ClosingPhraseMatcher, PhraseMatcher, normalize};
pub use phrase_detector::{DetectorSettings, PhraseDetector, PhraseDetectorState};
pub use recognizer::{
    ChannelRecognizer, Recognizer, RecognizerEvent, RecognizerFeed, UtteranceForwarder,
};
