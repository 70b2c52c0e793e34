//! State published by a session controller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conversation::{Conversation, MessageId};
use crate::voice::UtteranceId;

/// Whether the conversation is in a hands-free voice call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    #[default]
    Idle,
    HandsFree,
}

/// Caption mirroring the utterance being spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionState {
    /// Utterance the caption belongs to.
    pub utterance: UtteranceId,
    /// Full text being spoken.
    pub text: String,
    /// Byte offset of the sentence being spoken.
    pub highlight_offset: usize,
}

impl CaptionState {
    pub fn new(utterance: UtteranceId, text: impl Into<String>) -> Self {
        Self {
            utterance,
            text: text.into(),
            highlight_offset: 0,
        }
    }

    /// Text from the highlighted sentence onwards.
    pub fn highlighted(&self) -> &str {
        self.text.get(self.highlight_offset..).unwrap_or_default()
    }
}

/// Renderable markup extracted from an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    /// Message the markup came from.
    pub message_id: MessageId,
    /// HTML document ready to render.
    pub code: String,
}

/// Everything a renderer needs, published after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Messages, title and persona as of this state.
    pub conversation: Conversation,
    pub mode: InteractionMode,
    /// Caption of this conversation's utterance while it plays.
    pub caption: Option<CaptionState>,
    /// Latest preview per message; coder persona only.
    pub previews: BTreeMap<MessageId, Preview>,
    /// Failure of the latest request, cleared when the next one starts.
    pub error: Option<String>,
    /// Speech transcript not yet submitted.
    pub draft: String,
    /// Speech capture is running for this conversation.
    pub listening: bool,
    /// An utterance owned by this conversation is playing.
    pub speaking: bool,
    /// A request is in flight and one message is streaming.
    pub awaiting_response: bool,
}

impl SessionSnapshot {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            mode: InteractionMode::Idle,
            caption: None,
            previews: BTreeMap::new(),
            error: None,
            draft: String::new(),
            listening: false,
            speaking: false,
            awaiting_response: false,
        }
    }

    /// The message currently streaming, if any.
    pub fn streaming_message(&self) -> Option<&crate::conversation::Message> {
        self.conversation.messages.iter().find(|m| m.streaming)
    }

    pub fn last_message(&self) -> Option<&crate::conversation::Message> {
        self.conversation.messages.last()
    }
}
