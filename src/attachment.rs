//! User-supplied attachments: inline images and text documents.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AgentError, Result};

/// An image carried inline with a message, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub base64: String,
    pub mime_type: String,
}

impl ImageAttachment {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            base64: STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// `data:` URL suitable for rendering.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// A text document whose content is embedded into the request prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Image(ImageAttachment),
    Document(TextDocument),
}

fn image_mime_for(extension: &str) -> Option<&'static str> {
    match extension {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

impl Attachment {
    /// Read an attachment from disk, classifying it by extension.
    ///
    /// Images are base64 encoded; everything else must be UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Attachment`] if the file cannot be read or a
    /// document is not valid UTF-8.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| AgentError::Attachment(format!("{}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_owned());
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if let Some(mime) = image_mime_for(&extension) {
            return Ok(Self::Image(ImageAttachment::from_bytes(&bytes, mime)));
        }

        let content = String::from_utf8(bytes)
            .map_err(|_| AgentError::Attachment(format!("{name} is not a UTF-8 text file")))?;
        Ok(Self::Document(TextDocument { name, content }))
    }

    /// Split into the prompt sent to the model and the inline image, if any.
    ///
    /// Documents are embedded ahead of the question; the caller keeps the
    /// original `prompt` for the message shown to the user.
    pub fn compose(prompt: &str, attachment: Option<Attachment>) -> (String, Option<ImageAttachment>) {
        match attachment {
            None => (prompt.to_owned(), None),
            Some(Self::Image(image)) => (prompt.to_owned(), Some(image)),
            Some(Self::Document(doc)) => (
                format!(
                    "Based on the following document content, please answer the user's question.\n\n\
                     DOCUMENT: \"{}\"\n---\n{}\n---\n\nQUESTION: {prompt}",
                    doc.name, doc.content
                ),
                None,
            ),
        }
    }
}
