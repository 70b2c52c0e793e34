//! Conversation and message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::attachment::ImageAttachment;
use crate::persona::AgentPersona;

static NEXT_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Opaque message identity. Ids compare in creation order process-wide.
///
/// Deserializing an id moves the allocator past it, so messages created after
/// loading saved history never reuse a stored id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed))
    }

    fn reserve(self) -> Self {
        NEXT_MESSAGE_SEQ.fetch_max(self.0.saturating_add(1), Ordering::Relaxed);
        self
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(|raw| Self(raw).reserve())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used in markdown exports.
    pub fn export_label(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "AI",
        }
    }
}

/// A cited web source attached to a grounded answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: String,
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    /// Mutable while `streaming` is set, fixed afterwards.
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<GroundingSource>,
    #[serde(default)]
    pub streaming: bool,
}

impl Message {
    pub fn user(text: impl Into<String>, image: Option<ImageAttachment>) -> Self {
        Self {
            id: MessageId::next(),
            role: Role::User,
            text: text.into(),
            image,
            sources: Vec::new(),
            streaming: false,
        }
    }

    /// A streaming assistant message showing `text` until the reply arrives.
    pub fn placeholder(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::next(),
            role: Role::Assistant,
            text: text.into(),
            image: None,
            sources: Vec::new(),
            streaming: true,
        }
    }
}

/// Setup state for personas that need an onboarding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardingState {
    Pending,
    Complete,
}

/// Derive a conversation title from the first user message.
///
/// Keeps the first `max_chars` characters and appends `...` when truncated.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// A single chat with one persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub persona: AgentPersona,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboarding: Option<OnboardingState>,
    /// Set once a title has been derived; titles are never re-derived.
    #[serde(default)]
    pub title_derived: bool,
}

impl Conversation {
    /// Start an empty conversation with `persona`.
    pub fn new(persona: AgentPersona) -> Self {
        let onboarding = persona
            .requires_onboarding()
            .then_some(OnboardingState::Pending);
        Self {
            id: Uuid::new_v4(),
            title: persona.new_chat_title().to_owned(),
            created_at: Utc::now(),
            persona,
            messages: Vec::new(),
            onboarding,
            title_derived: false,
        }
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Number of messages currently marked as streaming.
    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.streaming).count()
    }

    pub fn is_onboarding_pending(&self) -> bool {
        self.onboarding == Some(OnboardingState::Pending)
    }

    /// Append a message, deriving the title on the first one.
    pub fn push(&mut self, message: Message, title_max_chars: usize) {
        self.update_messages(
            |messages| messages.push(message),
            None,
            title_max_chars,
        );
    }

    /// Replace the whole message list, optionally updating onboarding state.
    pub fn replace_messages(
        &mut self,
        messages: Vec<Message>,
        onboarding: Option<OnboardingState>,
        title_max_chars: usize,
    ) {
        self.update_messages(|current| *current = messages, onboarding, title_max_chars);
    }

    fn update_messages(
        &mut self,
        apply: impl FnOnce(&mut Vec<Message>),
        onboarding: Option<OnboardingState>,
        title_max_chars: usize,
    ) {
        let was_empty = self.messages.is_empty();
        let was_pending = self.is_onboarding_pending();
        apply(&mut self.messages);
        if let Some(state) = onboarding {
            self.onboarding = Some(state);
        }
        if self.title_derived || !was_empty || was_pending || self.messages.is_empty() {
            return;
        }
        if let Some(first_user) = self.messages.iter().find(|m| m.role == Role::User) {
            self.title = derive_title(&first_user.text, title_max_chars);
            self.title_derived = true;
        }
    }

    /// Render the conversation as markdown for export.
    pub fn export_markdown(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("**{}**: {}", m.role.export_label(), m.text))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// File name used for markdown exports.
    pub fn export_file_name(&self) -> String {
        let stem: String = self
            .title
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        format!("{stem}.md")
    }
}
