//! Config persistence and the effect of loaded settings on a session.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use intelliagent::config::{AgentConfig, SpeakPolicy};
use intelliagent::session::{SessionController, SessionServices};
use intelliagent::testing::{FakeRecognizer, FakeSynthesizer, ScriptedCompletions};
use intelliagent::{AgentPersona, Conversation, VoiceInput, VoiceOutput};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = AgentConfig::default();
    config.session.title_max_chars = 12;
    config.session.speak_policy = SpeakPolicy::ModeAtSubmit;
    config.voice.auto_listen = false;
    config.voice.fallback_locale = "en-GB".into();
    config.save_to_file(&path).unwrap();

    let loaded = AgentConfig::from_file(&path).unwrap();
    assert_eq!(loaded.session.title_max_chars, 12);
    assert_eq!(loaded.session.speak_policy, SpeakPolicy::ModeAtSubmit);
    assert!(!loaded.voice.auto_listen);
    assert_eq!(loaded.voice.fallback_locale, "en-GB");
    assert_eq!(loaded.gemini.model, config.gemini.model);
}

#[test]
fn partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[session]\nsearching_placeholder = \"Looking it up...\"\n",
    )
    .unwrap();

    let loaded = AgentConfig::from_file(&path).unwrap();
    assert_eq!(loaded.session.searching_placeholder, "Looking it up...");
    assert_eq!(loaded.session.title_max_chars, 40);
    assert_eq!(loaded.gemini.api_key_env, "GEMINI_API_KEY");
}

#[test]
fn malformed_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[session\n").unwrap();
    assert!(matches!(
        AgentConfig::from_file(&path),
        Err(intelliagent::AgentError::Config(_))
    ));
}

#[tokio::test]
async fn loaded_title_length_applies_to_new_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[session]\ntitle_max_chars = 5\n").unwrap();
    let config = AgentConfig::from_file(&path).unwrap();

    let completions = Arc::new(ScriptedCompletions::new());
    completions.push_reply(&["Sure."]);
    let services = SessionServices {
        completions,
        voice_output: VoiceOutput::new(Arc::new(FakeSynthesizer::new()), config.voice.clone())
            .unwrap(),
        voice_input: VoiceInput::new(Arc::new(FakeRecognizer::new()), &config.voice).unwrap(),
    };
    let session = SessionController::spawn(
        Conversation::new(AgentPersona::TaskAgent),
        services,
        config,
    );

    session.submit("Organize my garage", None).await.unwrap();
    let mut rx = session.watch();
    let done = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| !s.awaiting_response),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(done.conversation.title, "Organ...");
}
