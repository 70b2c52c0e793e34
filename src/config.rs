//! Configuration types for the chat session core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Completion service settings.
    pub gemini: GeminiConfig,
    /// Speech output/input settings.
    pub voice: VoiceConfig,
    /// Conversation turn-taking settings.
    pub session: SessionConfig,
}

/// Generative Language API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// Base URL of the REST API (overridable for tests and proxies).
    pub base_url: String,
    /// Model used for chat completions and grounded search.
    pub model: String,
    /// Model used for image edits.
    pub image_edit_model: String,
    /// Model used for image generation.
    pub image_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_owned(),
            model: "gemini-2.5-flash".to_owned(),
            image_edit_model: "gemini-2.5-flash-image-preview".to_owned(),
            image_model: "imagen-4.0-generate-001".to_owned(),
            api_key_env: "GEMINI_API_KEY".to_owned(),
        }
    }
}

impl GeminiConfig {
    /// Read the API key from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns a config error if the variable is unset or empty.
    pub fn api_key(&self) -> crate::error::Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(crate::error::AgentError::Config(format!(
                "{} environment variable not set",
                self.api_key_env
            ))),
        }
    }
}

/// Connect tone played when a hands-free call starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// Sine frequency in Hz.
    pub frequency_hz: f32,
    /// Initial gain in `[0, 1]`.
    pub gain: f32,
    /// Length of the exponential fade in ms.
    pub duration_ms: u32,
    /// Render sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 600.0,
            gain: 0.1,
            duration_ms: 500,
            sample_rate: 24_000,
        }
    }
}

/// Speech output/input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Language prefix preferred when choosing a synthetic voice.
    pub preferred_language: String,
    /// Full locale used as the third selection tier and for recognition.
    pub fallback_locale: String,
    /// Greeting spoken when a hands-free call starts.
    pub greeting: String,
    /// Connect tone settings.
    pub connect_tone: ToneConfig,
    /// Start capture automatically when an utterance ends naturally in hands-free mode.
    pub auto_listen: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            preferred_language: "en".to_owned(),
            fallback_locale: "en-US".to_owned(),
            greeting: "Hello, I'm IntelliAgent. What would you like to talk about? \
                       You can also upload a file for us to discuss."
                .to_owned(),
            connect_tone: ToneConfig::default(),
            auto_listen: true,
        }
    }
}

/// Whether a finished reply is spoken after the user left hands-free mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakPolicy {
    /// Check the interaction mode right before handing text to speech output.
    #[default]
    RecheckMode,
    /// Use the mode that was active when the request was submitted.
    ModeAtSubmit,
}

/// Conversation turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Characters kept from the first user message when deriving a title.
    pub title_max_chars: usize,
    /// Text shown while a grounded search request is outstanding.
    pub searching_placeholder: String,
    /// Speech policy for replies that finish after the mode changed.
    pub speak_policy: SpeakPolicy,
    /// Capacity of the snapshot broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 40,
            searching_placeholder: "Searching the web...".to_owned(),
            speak_policy: SpeakPolicy::default(),
            event_capacity: 256,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/intelliagent/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("intelliagent")
            .join("config.toml")
    }
}
