//! Error types for the chat session core.

/// Top-level error type for sessions, collaborators and voice services.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Transport or model failure while opening a request.
    #[error("request failed: {0}")]
    Request(String),

    /// Failure reported mid-stream by the completion service.
    #[error("stream failed: {0}")]
    Stream(String),

    /// Speech synthesis or capture engine failure.
    #[error("voice engine error: {0}")]
    Voice(String),

    /// Attachment could not be read or decoded.
    #[error("attachment error: {0}")]
    Attachment(String),

    /// A response is already being awaited for this conversation.
    #[error("a response is already in progress")]
    Busy,

    /// Neither prompt text nor an attachment was supplied.
    #[error("prompt is empty")]
    EmptyPrompt,

    /// Operation is not available for the conversation's persona.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// No message with this id exists in the conversation.
    #[error("unknown message {0}")]
    UnknownMessage(String),

    /// Setting key does not belong to the active persona.
    #[error("setting `{key}` does not apply to persona `{persona}`")]
    SettingMismatch {
        /// The rejected setting key.
        key: String,
        /// Persona identifier the update was attempted on.
        persona: String,
    },

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// The session actor has shut down.
    #[error("session closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether this error is a precondition rejection that leaves the session untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Busy
                | Self::EmptyPrompt
                | Self::Unsupported(_)
                | Self::UnknownMessage(_)
                | Self::SettingMismatch { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
