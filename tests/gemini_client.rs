//! HTTP contract tests for the Gemini client against a mock server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use futures_util::StreamExt;
use intelliagent::config::{AgentConfig, GeminiConfig};
use intelliagent::persona::{AgentPersona, CoderSettings};
use intelliagent::provider::{AspectRatio, CompletionRequest, CompletionService, ImageService};
use intelliagent::session::{SessionController, SessionServices};
use intelliagent::testing::{FakeRecognizer, FakeSynthesizer};
use intelliagent::{AgentError, Conversation, GeminiClient, ImageAttachment, VoiceInput, VoiceOutput};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL_PATH: &str = "/v1beta/models/gemini-2.5-flash";

fn client(server: &MockServer) -> GeminiClient {
    let config = GeminiConfig {
        base_url: server.uri(),
        ..GeminiConfig::default()
    };
    GeminiClient::with_api_key(config, "test-key")
}

fn sse(chunks: &[&str]) -> String {
    chunks
        .iter()
        .map(|text| {
            let payload = json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] });
            format!("data: {payload}\r\n\r\n")
        })
        .collect()
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

#[tokio::test]
async fn stream_yields_fragments_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:streamGenerateContent")))
        .and(query_param("alt", "sse"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{ "role": "user", "parts": [{ "text": "hello" }] }]
        })))
        .respond_with(sse_response(sse(&["Hel", "lo ", "there"])))
        .expect(1)
        .mount(&server)
        .await;

    let stream = client(&server)
        .stream(CompletionRequest::new("hello", AgentPersona::TaskAgent))
        .await
        .unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["Hel", "lo ", "there"]);
}

#[tokio::test]
async fn stream_sends_persona_instruction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:streamGenerateContent")))
        .respond_with(sse_response(sse(&["ok"])))
        .mount(&server)
        .await;

    let persona = AgentPersona::Coder(CoderSettings {
        language: "Rust".into(),
    });
    let stream = client(&server)
        .stream(CompletionRequest::new("hi", persona))
        .await
        .unwrap();
    let _: Vec<_> = stream.collect().await;

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    let instruction = body["systemInstruction"]["parts"][0]["text"].as_str().unwrap();
    assert!(instruction.contains("Rust"));
}

#[tokio::test]
async fn stream_error_event_ends_the_stream() {
    let server = MockServer::start().await;
    let body = format!(
        "{}data: {}\n\n{}",
        sse(&["partial"]),
        json!({ "error": { "message": "safety block" } }),
        sse(&["never"])
    );
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:streamGenerateContent")))
        .respond_with(sse_response(body))
        .mount(&server)
        .await;

    let stream = client(&server)
        .stream(CompletionRequest::new("q", AgentPersona::TaskAgent))
        .await
        .unwrap();
    let items: Vec<_> = stream.collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "partial");
    assert!(matches!(&items[1], Err(AgentError::Stream(m)) if m == "safety block"));
}

#[tokio::test]
async fn http_error_is_reported_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:streamGenerateContent")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "API key not valid." }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .stream(CompletionRequest::new("q", AgentPersona::TaskAgent))
        .await
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "request failed: HTTP 400: API key not valid.");
}

#[tokio::test]
async fn grounded_answer_carries_sources() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:generateContent")))
        .and(body_partial_json(json!({ "tools": [{ "google_search": {} }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "It will rain." }] },
                "groundingMetadata": { "groundingChunks": [
                    { "web": { "uri": "https://weather.example", "title": "Forecast" } },
                    { "web": { "uri": "", "title": "Blank" } }
                ] }
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let answer = client(&server).grounded("weather tomorrow?").await.unwrap();
    assert_eq!(answer.text, "It will rain.");
    assert_eq!(answer.sources.len(), 1);
    assert_eq!(answer.sources[0].title, "Forecast");
}

#[tokio::test]
async fn image_edit_returns_image_and_commentary() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash-image-preview:generateContent"))
        .and(body_partial_json(json!({
            "generationConfig": { "responseModalities": ["IMAGE", "TEXT"] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "Made it blue." },
                { "inlineData": { "mimeType": "image/png", "data": "Ymx1ZQ==" } }
            ] } }]
        })))
        .mount(&server)
        .await;

    let source = ImageAttachment::from_bytes(b"red", "image/png");
    let edit = client(&server)
        .edit_image("make it blue", &source)
        .await
        .unwrap();
    assert_eq!(edit.image.base64, "Ymx1ZQ==");
    assert_eq!(edit.text.as_deref(), Some("Made it blue."));

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["data"], source.base64);
}

#[tokio::test]
async fn image_edit_without_image_is_a_refusal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-flash-image-preview:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{ "content": { "parts": [{ "text": "I can't do that." }] } }]
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .edit_image("x", &ImageAttachment::from_bytes(b"x", "image/png"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("did not return an image"));
}

#[tokio::test]
async fn generate_images_posts_predict_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/imagen-4.0-generate-001:predict"))
        .and(body_partial_json(json!({
            "instances": [{ "prompt": "a lighthouse" }],
            "parameters": { "sampleCount": 2, "aspectRatio": "16:9", "outputMimeType": "image/png" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "predictions": [
                { "bytesBase64Encoded": "AAA=", "mimeType": "image/png" },
                { "bytesBase64Encoded": "BBB=" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let images = client(&server)
        .generate_images("a lighthouse", 2, AspectRatio::Landscape)
        .await
        .unwrap();
    assert_eq!(images.len(), 2);
    assert_eq!(images[1].mime_type, "image/png");
}

#[tokio::test]
async fn empty_predictions_are_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/imagen-4.0-generate-001:predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "predictions": [] })))
        .mount(&server)
        .await;

    let err = client(&server)
        .generate_images("nothing", 1, AspectRatio::Square)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no images were generated"));
}

#[tokio::test]
async fn session_streams_from_http_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{MODEL_PATH}:streamGenerateContent")))
        .respond_with(sse_response(sse(&["Break it ", "into steps."])))
        .mount(&server)
        .await;

    let config = AgentConfig {
        gemini: GeminiConfig {
            base_url: server.uri(),
            ..GeminiConfig::default()
        },
        ..AgentConfig::default()
    };
    let services = SessionServices {
        completions: Arc::new(GeminiClient::with_api_key(config.gemini.clone(), "k")),
        voice_output: VoiceOutput::new(Arc::new(FakeSynthesizer::new()), config.voice.clone())
            .unwrap(),
        voice_input: VoiceInput::new(Arc::new(FakeRecognizer::new()), &config.voice).unwrap(),
    };
    let session = SessionController::spawn(
        Conversation::new(AgentPersona::TaskAgent),
        services,
        config,
    );

    session.submit("help me plan", None).await.unwrap();
    let mut rx = session.watch();
    let done = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| !s.awaiting_response),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(done.conversation.messages[1].text, "Break it into steps.");
    assert!(done.error.is_none());
}
