//! Collaborator seams for the generative-AI service.
//!
//! The session controller only sees [`CompletionService`]; image personas use
//! [`ImageService`]. [`gemini::GeminiClient`] implements both over HTTP.

pub mod gemini;
pub mod sse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::attachment::ImageAttachment;
use crate::conversation::GroundingSource;
use crate::error::Result;
use crate::persona::AgentPersona;
use crate::stream::FragmentStream;

pub use gemini::GeminiClient;

/// One streaming completion request. Requests carry no history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// User text, with any document contents already embedded.
    pub prompt: String,
    /// Persona whose system instruction accompanies the prompt.
    pub persona: AgentPersona,
    /// Image sent inline alongside the prompt.
    pub image: Option<ImageAttachment>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, persona: AgentPersona) -> Self {
        Self {
            prompt: prompt.into(),
            persona,
            image: None,
        }
    }

    pub fn with_image(mut self, image: Option<ImageAttachment>) -> Self {
        self.image = image;
        self
    }
}

/// Answer from a search-grounded request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundedAnswer {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

impl GroundedAnswer {
    /// Build an answer, dropping sources with a blank uri or title.
    pub fn new(text: impl Into<String>, sources: Vec<GroundingSource>) -> Self {
        Self {
            text: text.into(),
            sources: sources
                .into_iter()
                .filter(|s| !s.uri.trim().is_empty() && !s.title.trim().is_empty())
                .collect(),
        }
    }
}

/// Text completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Open a streaming request. The returned stream is lazy and finite.
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream>;

    /// Single-shot request grounded in web search results.
    async fn grounded(&self, prompt: &str) -> Result<GroundedAnswer>;
}

/// Output shape for generated images.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "3:4")]
    ClassicPortrait,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::Classic => "4:3",
            Self::ClassicPortrait => "3:4",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::Square,
            Self::Landscape,
            Self::Portrait,
            Self::Classic,
            Self::ClassicPortrait,
        ]
        .into_iter()
        .find(|ratio| ratio.as_str() == value.trim())
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an image edit: the edited image plus any commentary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEdit {
    pub image: ImageAttachment,
    pub text: Option<String>,
}

/// Single-shot image backend.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Edit `image` according to `prompt`.
    ///
    /// Fails with a request error when the model returns no image.
    async fn edit_image(&self, prompt: &str, image: &ImageAttachment) -> Result<ImageEdit>;

    /// Generate `count` PNG images.
    async fn generate_images(
        &self,
        prompt: &str,
        count: u8,
        aspect_ratio: AspectRatio,
    ) -> Result<Vec<ImageAttachment>>;
}
