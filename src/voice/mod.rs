//! Speech output and capture services.
//!
//! [`VoiceOutput`] and [`VoiceInput`] are process-wide handles that wrap a
//! platform engine. Engines are plain traits: commands go in through method
//! calls, and everything the engine observes comes back through an unbounded
//! channel sink handed over by `attach`. Each utterance or capture session is
//! tagged with a generation number so events from cancelled work are dropped.

pub mod input;
pub mod output;
pub mod selection;
pub mod tone;

use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::conversation::MessageId;
use crate::error::Result;

pub use input::{VoiceInput, VoiceInputEvent};
pub use output::{SpeakOutcome, VoiceOutput, VoiceOutputEvent};
pub use selection::{VoiceInfo, VoiceQuality, select_voice};

/// Identity of one utterance: the conversation that owns it plus a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UtteranceId {
    /// Conversation that started the utterance.
    pub owner: Uuid,
    /// Message id for read-aloud and replies, `greeting` for the call greeting.
    pub key: String,
}

impl UtteranceId {
    pub fn new(owner: Uuid, key: impl Into<String>) -> Self {
        Self {
            owner,
            key: key.into(),
        }
    }

    /// Utterance reading a message aloud.
    pub fn message(owner: Uuid, id: MessageId) -> Self {
        Self::new(owner, id.to_string())
    }

    /// The hands-free greeting of a conversation.
    pub fn greeting(owner: Uuid) -> Self {
        Self::new(owner, "greeting")
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.key)
    }
}

/// Kind of position marker reported while speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Word,
    Sentence,
}

/// Work handed to a synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub generation: u64,
    pub text: String,
    pub voice: Option<VoiceInfo>,
}

/// What a synthesizer reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthEvent {
    Boundary {
        generation: u64,
        kind: BoundaryKind,
        /// Byte offset into the utterance text.
        char_index: usize,
    },
    Finished {
        generation: u64,
    },
    Failed {
        generation: u64,
        message: String,
    },
    /// The installed voice list changed.
    VoicesChanged,
}

pub type SynthSink = mpsc::UnboundedSender<SynthEvent>;

/// Text-to-speech engine.
///
/// `speak` and `play_tone` start work and return immediately; completion is
/// reported through the sink.
pub trait SpeechSynthesizer: Send + Sync {
    /// Hand the engine its event sink. Called once before any other method.
    fn attach(&self, sink: SynthSink) -> Result<()>;

    fn voices(&self) -> Vec<VoiceInfo>;

    fn speak(&self, request: SynthesisRequest) -> Result<()>;

    /// Stop the current utterance without reporting `Finished`.
    fn cancel(&self);

    /// Play raw mono samples.
    fn play_tone(&self, samples: &[f32], sample_rate: u32) -> Result<()>;

    fn shutdown(&self) {}
}

/// What a recognizer reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// One recognition batch.
    Result {
        generation: u64,
        /// Newly finalized text, appended to the transcript.
        finalized: String,
        /// Current interim hypothesis, replacing the previous one.
        interim: String,
    },
    /// Capture ended on its own (silence or engine stop).
    Ended { generation: u64 },
    Failed { generation: u64, message: String },
}

pub type RecognizerSink = mpsc::UnboundedSender<RecognizerEvent>;

/// Continuous speech recognition engine.
pub trait SpeechRecognizer: Send + Sync {
    /// Hand the engine its event sink. Called once before any other method.
    fn attach(&self, sink: RecognizerSink) -> Result<()>;

    /// Start continuous capture with interim results.
    fn begin(&self, generation: u64, locale: &str) -> Result<()>;

    /// Stop capture. Late events for the stopped generation are ignored.
    fn end(&self);

    fn shutdown(&self) {}
}
