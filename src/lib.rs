//! IntelliAgent: multi-persona streaming chat with hands-free voice.
//!
//! A conversation is driven by a [`SessionController`], an actor that owns the
//! message list and coordinates three collaborators:
//! - **Completions**: streamed or search-grounded replies from a
//!   [`CompletionService`] (Gemini over HTTP by default)
//! - **Voice output**: one shared [`VoiceOutput`] speaking at most one
//!   utterance at a time
//! - **Voice input**: one shared [`VoiceInput`] capturing for at most one
//!   conversation at a time
//!
//! Every state change is published as a [`SessionSnapshot`].

pub mod attachment;
pub mod config;
pub mod conversation;
pub mod error;
pub mod fence;
pub mod persona;
pub mod provider;
pub mod session;
pub mod stream;
pub mod testing;
pub mod voice;

pub use attachment::{Attachment, ImageAttachment};
pub use config::AgentConfig;
pub use conversation::{Conversation, Message, MessageId};
pub use error::{AgentError, Result};
pub use persona::AgentPersona;
pub use provider::{CompletionService, GeminiClient, ImageService};
pub use session::{InteractionMode, SessionController, SessionServices, SessionSnapshot};
pub use voice::{VoiceInput, VoiceOutput};
