//! Generative Language REST client.
//!
//! Streaming uses `:streamGenerateContent?alt=sse`; each SSE `data:` payload
//! is a partial `GenerateContentResponse` whose candidate text parts are
//! forwarded as fragments. Grounded search, image edits and Imagen generation
//! are single-shot calls.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

use super::sse::SseDecoder;
use super::{
    AspectRatio, CompletionRequest, CompletionService, GroundedAnswer, ImageEdit, ImageService,
};
use crate::attachment::ImageAttachment;
use crate::config::GeminiConfig;
use crate::conversation::GroundingSource;
use crate::error::{AgentError, Result};
use crate::stream::FragmentStream;

/// HTTP client for the Generative Language API.
pub struct GeminiClient {
    config: GeminiConfig,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl GeminiClient {
    /// Build a client, reading the API key from the configured variable.
    ///
    /// # Errors
    ///
    /// Returns a config error if the key is missing.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let api_key = config.api_key()?;
        Ok(Self::with_api_key(config, api_key))
    }

    pub fn with_api_key(config: GeminiConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:{method}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Request(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &text));
        }
        Ok(response)
    }

    async fn post_json<T: DeserializeOwned>(&self, url: &str, body: &Value) -> Result<T> {
        self.post(url, body)
            .await?
            .json::<T>()
            .await
            .map_err(|e| AgentError::Request(format!("malformed response: {e}")))
    }
}

fn map_http_error(status: reqwest::StatusCode, body: &str) -> AgentError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
        .unwrap_or_else(|| body.to_owned());
    AgentError::Request(format!("HTTP {}: {message}", status.as_u16()))
}

fn user_parts(prompt: &str, image: Option<&ImageAttachment>) -> Value {
    let mut parts = Vec::with_capacity(2);
    if let Some(image) = image {
        parts.push(json!({
            "inlineData": { "mimeType": image.mime_type, "data": image.base64 }
        }));
    }
    parts.push(json!({ "text": prompt }));
    json!([{ "role": "user", "parts": parts }])
}

fn stream_body(request: &CompletionRequest) -> Value {
    json!({
        "contents": user_parts(&request.prompt, request.image.as_ref()),
        "systemInstruction": { "parts": [{ "text": request.persona.system_instruction() }] },
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSource {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl GenerateContentResponse {
    fn first_parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or_default()
    }

    /// Concatenated visible text of the first candidate.
    fn text(&self) -> String {
        self.first_parts()
            .iter()
            .filter(|p| !p.thought)
            .filter_map(|p| p.text.as_deref())
            .collect()
    }

    fn sources(&self) -> Vec<GroundingSource> {
        self.candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|m| {
                m.grounding_chunks
                    .iter()
                    .filter_map(|chunk| chunk.web.as_ref())
                    .map(|web| GroundingSource {
                        uri: web.uri.clone().unwrap_or_default(),
                        title: web.title.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse one SSE payload into a fragment. Empty text yields `None`.
fn parse_stream_chunk(data: &str) -> Option<Result<String>> {
    let chunk: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            return Some(Err(AgentError::Stream(format!("malformed chunk: {e}"))));
        }
    };
    if let Some(error) = &chunk.error {
        return Some(Err(AgentError::Stream(error.message.clone())));
    }
    let text = chunk.text();
    (!text.is_empty()).then_some(Ok(text))
}

struct StreamState {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String>>,
    done: bool,
}

impl StreamState {
    fn queue(&mut self, data: &str) {
        if let Some(item) = parse_stream_chunk(data) {
            self.pending.push_back(item);
        }
    }
}

fn fragment_stream(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String>> + Send {
    futures_util::stream::unfold(
        StreamState {
            bytes: Box::pin(bytes),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    if item.is_err() {
                        // Nothing after a failure is delivered.
                        state.pending.clear();
                        state.done = true;
                    }
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.decoder.push(&chunk) {
                            if !event.is_done() {
                                state.queue(&event.data);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        let err = AgentError::Stream(format!("stream read error: {e}"));
                        return Some((Err(err), state));
                    }
                    None => {
                        state.done = true;
                        if let Some(event) = state.decoder.finish()
                            && !event.is_done()
                        {
                            state.queue(&event.data);
                        }
                    }
                }
            }
        },
    )
}

#[async_trait]
impl CompletionService for GeminiClient {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream> {
        let url = format!(
            "{}?alt=sse",
            self.endpoint(&self.config.model, "streamGenerateContent")
        );
        debug!(persona = %request.persona, model = %self.config.model, "opening completion stream");
        let response = self.post(&url, &stream_body(&request)).await?;
        Ok(Box::pin(fragment_stream(response.bytes_stream())))
    }

    async fn grounded(&self, prompt: &str) -> Result<GroundedAnswer> {
        let url = self.endpoint(&self.config.model, "generateContent");
        let body = json!({
            "contents": user_parts(prompt, None),
            "tools": [{ "google_search": {} }],
        });
        let response: GenerateContentResponse = self.post_json(&url, &body).await?;
        let answer = GroundedAnswer::new(response.text(), response.sources());
        debug!(sources = answer.sources.len(), "grounded answer received");
        Ok(answer)
    }
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[async_trait]
impl ImageService for GeminiClient {
    async fn edit_image(&self, prompt: &str, image: &ImageAttachment) -> Result<ImageEdit> {
        let url = self.endpoint(&self.config.image_edit_model, "generateContent");
        let body = json!({
            "contents": user_parts(prompt, Some(image)),
            "generationConfig": { "responseModalities": ["IMAGE", "TEXT"] },
        });
        let response: GenerateContentResponse = self.post_json(&url, &body).await?;

        let mut edited = None;
        let mut text = None;
        for part in response.first_parts() {
            if let Some(t) = &part.text {
                text = Some(t.clone());
            } else if let Some(data) = &part.inline_data {
                edited = Some(ImageAttachment {
                    base64: data.data.clone(),
                    mime_type: data.mime_type.clone(),
                });
            }
        }
        match edited {
            Some(image) => Ok(ImageEdit { image, text }),
            None => {
                warn!("image edit returned no image");
                Err(AgentError::Request(
                    "The model did not return an image. It might have refused the request."
                        .to_owned(),
                ))
            }
        }
    }

    async fn generate_images(
        &self,
        prompt: &str,
        count: u8,
        aspect_ratio: AspectRatio,
    ) -> Result<Vec<ImageAttachment>> {
        let url = self.endpoint(&self.config.image_model, "predict");
        let body = json!({
            "instances": [{ "prompt": prompt }],
            "parameters": {
                "sampleCount": count.max(1),
                "aspectRatio": aspect_ratio.as_str(),
                "outputMimeType": "image/png",
            },
        });
        let response: PredictResponse = self.post_json(&url, &body).await?;
        let images: Vec<ImageAttachment> = response
            .predictions
            .into_iter()
            .filter_map(|p| {
                p.bytes_base64_encoded.map(|base64| ImageAttachment {
                    base64,
                    mime_type: p.mime_type.unwrap_or_else(|| "image/png".to_owned()),
                })
            })
            .collect();
        if images.is_empty() {
            return Err(AgentError::Request("no images were generated".to_owned()));
        }
        Ok(images)
    }
}
