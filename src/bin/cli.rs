//! Terminal front end for IntelliAgent.

use base64::Engine as _;
use clap::Parser;
use intelliagent::conversation::Role;
use intelliagent::persona::MoneyOnboarding;
use intelliagent::provider::AspectRatio;
use intelliagent::voice::{
    BoundaryKind, RecognizerEvent, RecognizerSink, SpeechRecognizer, SpeechSynthesizer,
    SynthEvent, SynthSink, SynthesisRequest, VoiceInfo,
};
use intelliagent::{
    AgentConfig, AgentPersona, Attachment, GeminiClient, ImageService, MessageId,
    SessionController, SessionServices, SessionSnapshot, VoiceInput, VoiceOutput,
};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// IntelliAgent: multi-persona chat with hands-free voice.
#[derive(Parser)]
#[command(name = "intelliagent", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persona to chat with.
    #[arg(short, long, default_value = "task_agent")]
    persona: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("intelliagent=info,reqwest=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(ref path) => AgentConfig::from_file(path)?,
        None => {
            let path = AgentConfig::default_config_path();
            if path.exists() {
                AgentConfig::from_file(&path)?
            } else {
                AgentConfig::default()
            }
        }
    };
    let persona = AgentPersona::from_id(&cli.persona).ok_or_else(|| {
        anyhow::anyhow!(
            "unknown persona `{}` (expected one of: {})",
            cli.persona,
            AgentPersona::IDS.join(", ")
        )
    })?;

    let client = Arc::new(GeminiClient::new(config.gemini.clone())?);
    println!("IntelliAgent v{} | {}", env!("CARGO_PKG_VERSION"), persona.display_name());
    let welcome = persona.welcome();
    println!("{} {}: {}", welcome.icon, welcome.title, welcome.description);
    println!("Commands: /call /read /listen /preview /set <key> <value> /attach <path> <prompt> /onboard /export /quit");

    if persona.is_image_only() {
        return run_image_repl(persona, client.as_ref()).await;
    }

    let recognizer = Arc::new(ConsoleRecognizer::default());
    let voice_output = VoiceOutput::new(Arc::new(ConsoleSynthesizer::default()), config.voice.clone())?;
    let voice_input = VoiceInput::new(recognizer.clone(), &config.voice)?;
    let services = SessionServices {
        completions: client,
        voice_output: voice_output.clone(),
        voice_input: voice_input.clone(),
    };
    let session = SessionController::spawn(
        intelliagent::Conversation::new(persona),
        services,
        config,
    );
    if session.snapshot().conversation.is_onboarding_pending() {
        println!("Run /onboard to complete the financial assessment first.");
    }
    let printer = tokio::spawn(print_replies(session.subscribe()));

    let cancel = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            let _ = cancel.shutdown().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if recognizer.feed(line) {
            continue;
        }
        match run_command(&session, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("! {e}"),
        }
    }

    session.shutdown().await.ok();
    voice_output.shutdown();
    voice_input.shutdown();
    printer.abort();
    Ok(())
}

/// Handle one REPL line. Returns `false` to quit.
async fn run_command(session: &SessionController, line: &str) -> anyhow::Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" | "/exit" => return Ok(false),
        "/call" => {
            let mode = session.toggle_hands_free().await?;
            println!("[mode: {mode:?}]");
        }
        "/listen" => {
            if session.snapshot().listening {
                session.stop_listening().await?;
            } else {
                session.start_listening().await?;
                println!("[listening; type what you would say]");
            }
        }
        "/stop" => {
            session.cancel_active_speech().await?;
        }
        "/read" => {
            let id = last_assistant(&session.snapshot())
                .ok_or_else(|| anyhow::anyhow!("no reply to read"))?;
            session.read_aloud(id).await?;
        }
        "/preview" => {
            let snapshot = session.snapshot();
            match snapshot.previews.values().last() {
                Some(preview) => {
                    let path = std::env::temp_dir().join(format!("{}.html", preview.message_id));
                    std::fs::write(&path, &preview.code)?;
                    println!("[preview written to {}]", path.display());
                }
                None => println!("[no preview available]"),
            }
        }
        "/explain" => {
            let snapshot = session.snapshot();
            let block = snapshot
                .conversation
                .messages
                .iter()
                .rev()
                .find_map(|m| intelliagent::fence::code_blocks(&m.text).pop())
                .ok_or_else(|| anyhow::anyhow!("no code block to explain"))?;
            session.explain_code(block.code, block.language).await?;
        }
        "/set" => {
            let (key, value) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("usage: /set <key> <value>"))?;
            session.update_setting(key, value.trim()).await?;
        }
        "/attach" => {
            let (path, prompt) = rest.split_once(' ').unwrap_or((rest, ""));
            session.submit_file(prompt, path).await?;
        }
        "/onboard" => {
            session.complete_onboarding(MoneyOnboarding::default()).await?;
        }
        "/export" => {
            let conversation = session.snapshot().conversation;
            let path = PathBuf::from(conversation.export_file_name());
            std::fs::write(&path, conversation.export_markdown())?;
            println!("[exported to {}]", path.display());
        }
        _ if command.starts_with('/') => println!("[unknown command {command}]"),
        _ => session.submit(line, None).await?,
    }
    Ok(true)
}

fn last_assistant(snapshot: &SessionSnapshot) -> Option<MessageId> {
    snapshot
        .conversation
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.id)
}

/// Print assistant text as it streams, plus errors.
async fn print_replies(mut rx: broadcast::Receiver<SessionSnapshot>) {
    let mut printed: Option<(MessageId, String)> = None;
    let mut finished: Option<MessageId> = None;
    let mut last_error: Option<String> = None;
    loop {
        let snapshot = match rx.recv().await {
            Ok(snapshot) => snapshot,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Some(message) = snapshot.last_message()
            && message.role == Role::Assistant
            && finished != Some(message.id)
        {
            let shown = match &printed {
                Some((id, text)) if *id == message.id => text.as_str(),
                _ => "",
            };
            match message.text.strip_prefix(shown) {
                Some(delta) => print!("{delta}"),
                None => print!("\n{}", message.text),
            }
            if message.streaming {
                printed = Some((message.id, message.text.clone()));
            } else {
                for source in &message.sources {
                    print!("\n  [{}]({})", source.title, source.uri);
                }
                println!();
                finished = Some(message.id);
                printed = None;
            }
            let _ = std::io::stdout().flush();
        }
        if snapshot.error != last_error {
            if let Some(error) = &snapshot.error {
                eprintln!("! {error}");
            }
            last_error = snapshot.error.clone();
        }
    }
}

async fn run_image_repl(persona: AgentPersona, images: &dyn ImageService) -> anyhow::Result<()> {
    match persona {
        AgentPersona::ImageEditor => println!("Usage: <image path> <edit prompt>"),
        _ => println!("Usage: <prompt> (prefix with 16:9, 9:16, 4:3 or 3:4 to change aspect)"),
    }
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        let result = match persona {
            AgentPersona::ImageEditor => edit_image(images, line).await,
            _ => generate_images(images, line).await,
        };
        if let Err(e) = result {
            eprintln!("! {e}");
        }
    }
    Ok(())
}

async fn edit_image(images: &dyn ImageService, line: &str) -> anyhow::Result<()> {
    let (path, prompt) = line
        .split_once(' ')
        .ok_or_else(|| anyhow::anyhow!("usage: <image path> <edit prompt>"))?;
    let Attachment::Image(source) = Attachment::from_path(Path::new(path))? else {
        anyhow::bail!("{path} is not an image");
    };
    let edit = images.edit_image(prompt.trim(), &source).await?;
    let out = save_image(&edit.image, "edited", 0)?;
    println!("[edited image written to {}]", out.display());
    if let Some(text) = edit.text {
        println!("{text}");
    }
    Ok(())
}

async fn generate_images(images: &dyn ImageService, line: &str) -> anyhow::Result<()> {
    let (aspect, prompt) = match line.split_once(' ') {
        Some((head, rest)) => match AspectRatio::parse(head) {
            Some(aspect) => (aspect, rest.trim()),
            None => (AspectRatio::Square, line),
        },
        None => (AspectRatio::Square, line),
    };
    let generated = images.generate_images(prompt, 1, aspect).await?;
    for (index, image) in generated.iter().enumerate() {
        let out = save_image(image, "generated", index)?;
        println!("[image written to {}]", out.display());
    }
    Ok(())
}

fn save_image(
    image: &intelliagent::ImageAttachment,
    stem: &str,
    index: usize,
) -> anyhow::Result<PathBuf> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(&image.base64)?;
    let extension = image.mime_type.rsplit('/').next().unwrap_or("png");
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let path = PathBuf::from(format!("{stem}-{stamp}-{index}.{extension}"));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Synthesizer that prints utterances sentence by sentence.
#[derive(Default)]
struct ConsoleSynthesizer {
    sink: Mutex<Option<SynthSink>>,
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn attach(&self, sink: SynthSink) -> intelliagent::Result<()> {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
        Ok(())
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        Vec::new()
    }

    fn speak(&self, request: SynthesisRequest) -> intelliagent::Result<()> {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(sink) = sink else {
            return Err(intelliagent::AgentError::Voice("synthesizer not attached".to_owned()));
        };
        println!("\n(speaking) {}", request.text);
        let mut offset = 0;
        for sentence in request.text.split_inclusive(['.', '!', '?']) {
            let _ = sink.send(SynthEvent::Boundary {
                generation: request.generation,
                kind: BoundaryKind::Sentence,
                char_index: offset,
            });
            offset += sentence.len();
        }
        let _ = sink.send(SynthEvent::Finished {
            generation: request.generation,
        });
        Ok(())
    }

    fn cancel(&self) {}

    fn play_tone(&self, samples: &[f32], sample_rate: u32) -> intelliagent::Result<()> {
        let millis = samples.len() as u64 * 1000 / u64::from(sample_rate.max(1));
        println!("(beep {millis} ms)");
        Ok(())
    }
}

#[derive(Default)]
struct RecognizerState {
    sink: Option<RecognizerSink>,
    capture: Option<u64>,
}

/// Recognizer that treats the next typed line as speech.
#[derive(Default)]
struct ConsoleRecognizer {
    state: Mutex<RecognizerState>,
}

impl ConsoleRecognizer {
    /// Deliver `line` as a finished utterance if a capture is open.
    fn feed(&self, line: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(generation) = state.capture.take() else {
            return false;
        };
        if let Some(sink) = &state.sink {
            let _ = sink.send(RecognizerEvent::Result {
                generation,
                finalized: line.to_owned(),
                interim: String::new(),
            });
            let _ = sink.send(RecognizerEvent::Ended { generation });
        }
        true
    }
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn attach(&self, sink: RecognizerSink) -> intelliagent::Result<()> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sink = Some(sink);
        Ok(())
    }

    fn begin(&self, generation: u64, locale: &str) -> intelliagent::Result<()> {
        info!(locale, "console capture open");
        self.state.lock().unwrap_or_else(|e| e.into_inner()).capture = Some(generation);
        Ok(())
    }

    fn end(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).capture = None;
    }
}
