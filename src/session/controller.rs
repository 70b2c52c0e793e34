//! Per-conversation session actor.
//!
//! [`SessionController`] is a cloneable handle; every operation is sent to a
//! single task that owns the conversation, the in-flight response and the
//! caption. The task also consumes turn events from the request task and the
//! shared voice services' broadcasts, and publishes a [`SessionSnapshot`]
//! after every mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{CaptionState, InteractionMode, Preview, SessionSnapshot};
use crate::attachment::{Attachment, ImageAttachment};
use crate::config::{AgentConfig, SpeakPolicy};
use crate::conversation::{Conversation, GroundingSource, Message, MessageId, OnboardingState};
use crate::error::{AgentError, Result};
use crate::fence;
use crate::persona::MoneyOnboarding;
use crate::provider::{CompletionRequest, CompletionService};
use crate::stream::{StreamingTextAccumulator, TurnEvent, TurnEventKind, pump_fragments};
use crate::voice::{
    SpeakOutcome, UtteranceId, VoiceInput, VoiceInputEvent, VoiceOutput, VoiceOutputEvent,
};

const COMMAND_CAPACITY: usize = 32;
const TURN_CAPACITY: usize = 64;

/// User message recorded when money onboarding completes.
pub const ONBOARDING_COMPLETE_MESSAGE: &str = "I've completed the financial assessment.";

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub completions: Arc<dyn CompletionService>,
    pub voice_output: VoiceOutput,
    pub voice_input: VoiceInput,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Submit {
        prompt: String,
        attachment: Option<Attachment>,
        reply: Reply<()>,
    },
    SubmitFile {
        prompt: String,
        path: PathBuf,
        reply: Reply<()>,
    },
    CancelSpeech {
        reply: Reply<bool>,
    },
    ToggleHandsFree {
        reply: Reply<InteractionMode>,
    },
    ExplainCode {
        code: String,
        language: String,
        reply: Reply<()>,
    },
    PreviewCode {
        message_id: MessageId,
        code: String,
        language: String,
        reply: Reply<bool>,
    },
    ReadAloud {
        message_id: MessageId,
        reply: Reply<SpeakOutcome>,
    },
    StartListening {
        reply: Reply<()>,
    },
    StopListening {
        reply: Reply<()>,
    },
    UpdateSetting {
        key: String,
        value: String,
        reply: Reply<()>,
    },
    CompleteOnboarding {
        answers: MoneyOnboarding,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to one conversation's session actor.
#[derive(Clone)]
pub struct SessionController {
    id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionSnapshot>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("conversation", &self.id)
            .finish()
    }
}

impl SessionController {
    /// Spawn the actor for `conversation`. Must be called inside a tokio runtime.
    pub fn spawn(conversation: Conversation, services: SessionServices, config: AgentConfig) -> Self {
        let id = conversation.id;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (turn_tx, turn_rx) = mpsc::channel(TURN_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(conversation.clone()));
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        let output_events = services.voice_output.subscribe();
        let input_events = services.voice_input.subscribe();

        info!(conversation = %id, persona = %conversation.persona, "session started");
        let actor = SessionActor {
            conversation,
            config,
            services,
            mode: InteractionMode::Idle,
            caption: None,
            previews: BTreeMap::new(),
            error: None,
            draft: String::new(),
            capture: None,
            active: None,
            next_turn: 0,
            turn_tx,
            snapshots: snapshot_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(command_rx, turn_rx, output_events, input_events));

        Self {
            id,
            commands: command_tx,
            snapshots: snapshot_rx,
            events,
        }
    }

    /// Id of the conversation this session drives.
    pub fn id(&self) -> Uuid {
        self.id
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AgentError::Closed)?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    /// Submit a prompt with an optional attachment. Returns once dispatched.
    ///
    /// # Errors
    ///
    /// `Busy` while a response is awaited, `EmptyPrompt` for a blank prompt
    /// without attachment, `Unsupported` for image-only personas.
    pub async fn submit(&self, prompt: impl Into<String>, attachment: Option<Attachment>) -> Result<()> {
        let prompt = prompt.into();
        self.request(|reply| SessionCommand::Submit {
            prompt,
            attachment,
            reply,
        })
        .await
    }

    /// Submit a prompt with the file at `path` attached.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit), plus `Attachment` when the file cannot be
    /// loaded; that failure is also recorded as the conversation error.
    pub async fn submit_file(&self, prompt: impl Into<String>, path: impl Into<PathBuf>) -> Result<()> {
        let prompt = prompt.into();
        let path = path.into();
        self.request(|reply| SessionCommand::SubmitFile {
            prompt,
            path,
            reply,
        })
        .await
    }

    /// Stop any utterance. Returns whether something was playing.
    pub async fn cancel_active_speech(&self) -> Result<bool> {
        self.request(|reply| SessionCommand::CancelSpeech { reply })
            .await
    }

    /// Enter or leave hands-free mode, returning the new mode.
    pub async fn toggle_hands_free(&self) -> Result<InteractionMode> {
        self.request(|reply| SessionCommand::ToggleHandsFree { reply })
            .await
    }

    /// Ask the model to explain a snippet.
    pub async fn explain_code(&self, code: impl Into<String>, language: impl Into<String>) -> Result<()> {
        let code = code.into();
        let language = language.into();
        self.request(|reply| SessionCommand::ExplainCode {
            code,
            language,
            reply,
        })
        .await
    }

    /// Publish `code` as the preview for `message_id`. Returns whether the
    /// language was previewable.
    pub async fn preview_code(
        &self,
        message_id: MessageId,
        code: impl Into<String>,
        language: impl Into<String>,
    ) -> Result<bool> {
        let code = code.into();
        let language = language.into();
        self.request(|reply| SessionCommand::PreviewCode {
            message_id,
            code,
            language,
            reply,
        })
        .await
    }

    /// Speak a message, or stop it if it is already being spoken.
    pub async fn read_aloud(&self, message_id: MessageId) -> Result<SpeakOutcome> {
        self.request(|reply| SessionCommand::ReadAloud { message_id, reply })
            .await
    }

    pub async fn start_listening(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StartListening { reply })
            .await
    }

    pub async fn stop_listening(&self) -> Result<()> {
        self.request(|reply| SessionCommand::StopListening { reply })
            .await
    }

    /// Update one persona setting.
    pub async fn update_setting(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.request(|reply| SessionCommand::UpdateSetting { key, value, reply })
            .await
    }

    /// Finish a pending onboarding and request the initial assessment.
    pub async fn complete_onboarding(&self, answers: MoneyOnboarding) -> Result<()> {
        self.request(|reply| SessionCommand::CompleteOnboarding { answers, reply })
            .await
    }

    /// Cancel the in-flight request and voice activity, then stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Every state published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.events.subscribe()
    }

    /// Latest-value view of the published state.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }
}

struct ActiveTurn {
    turn: u64,
    message_id: MessageId,
    accumulator: StreamingTextAccumulator,
    cancel: CancellationToken,
    mode_at_submit: InteractionMode,
}

struct SessionActor {
    conversation: Conversation,
    config: AgentConfig,
    services: SessionServices,
    mode: InteractionMode,
    caption: Option<CaptionState>,
    previews: BTreeMap<MessageId, Preview>,
    error: Option<String>,
    draft: String,
    /// Capture started by this session whose events are still expected.
    capture: Option<u64>,
    active: Option<ActiveTurn>,
    next_turn: u64,
    turn_tx: mpsc::Sender<TurnEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionSnapshot>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut turns: mpsc::Receiver<TurnEvent>,
        mut output_events: broadcast::Receiver<VoiceOutputEvent>,
        mut input_events: broadcast::Receiver<VoiceInputEvent>,
    ) {
        let mut output_open = true;
        let mut input_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = turns.recv() => self.handle_turn_event(event),
                event = output_events.recv(), if output_open => match event {
                    Ok(event) => self.handle_output_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "voice output events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => output_open = false,
                },
                event = input_events.recv(), if input_open => match event {
                    Ok(event) => self.handle_input_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "voice input events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => input_open = false,
                },
            }
        }
        debug!(conversation = %self.conversation.id, "session actor stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit {
                prompt,
                attachment,
                reply,
            } => {
                let _ = reply.send(self.submit(prompt, attachment));
            }
            SessionCommand::SubmitFile {
                prompt,
                path,
                reply,
            } => {
                let _ = reply.send(self.submit_file(prompt, path));
            }
            SessionCommand::CancelSpeech { reply } => {
                let _ = reply.send(Ok(self.cancel_active_speech()));
            }
            SessionCommand::ToggleHandsFree { reply } => {
                let _ = reply.send(Ok(self.toggle_hands_free()));
            }
            SessionCommand::ExplainCode {
                code,
                language,
                reply,
            } => {
                let _ = reply.send(self.explain_code(code, language));
            }
            SessionCommand::PreviewCode {
                message_id,
                code,
                language,
                reply,
            } => {
                let _ = reply.send(self.preview_code(message_id, code, language));
            }
            SessionCommand::ReadAloud { message_id, reply } => {
                let _ = reply.send(self.read_aloud(message_id));
            }
            SessionCommand::StartListening { reply } => {
                self.start_listening();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::StopListening { reply } => {
                self.services.voice_input.stop_for(self.conversation.id);
                self.publish();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::UpdateSetting { key, value, reply } => {
                let _ = reply.send(self.update_setting(&key, &value));
            }
            SessionCommand::CompleteOnboarding { answers, reply } => {
                let _ = reply.send(self.complete_onboarding(&answers));
            }
            SessionCommand::Shutdown { .. } => {}
        }
    }

    // ── Requests ─────────────────────────────────────────────

    fn check_can_request(&self) -> Result<()> {
        let persona = &self.conversation.persona;
        if persona.is_image_only() {
            return Err(AgentError::Unsupported(format!(
                "{} does not take chat prompts",
                persona.id()
            )));
        }
        if self.active.is_some() {
            return Err(AgentError::Busy);
        }
        Ok(())
    }

    fn submit(&mut self, prompt: String, attachment: Option<Attachment>) -> Result<()> {
        self.check_can_request()?;
        if prompt.trim().is_empty() && attachment.is_none() {
            return Err(AgentError::EmptyPrompt);
        }
        self.dispatch_user_turn(prompt, attachment);
        Ok(())
    }

    fn submit_file(&mut self, prompt: String, path: PathBuf) -> Result<()> {
        self.check_can_request()?;
        let attachment = match Attachment::from_path(&path) {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(conversation = %self.conversation.id, error = %e, "attachment rejected");
                self.error = Some(e.to_string());
                self.publish();
                return Err(e);
            }
        };
        self.dispatch_user_turn(prompt, Some(attachment));
        Ok(())
    }

    fn dispatch_user_turn(&mut self, prompt: String, attachment: Option<Attachment>) {
        self.silence_voice();
        self.previews.clear();
        let (request_prompt, image) = Attachment::compose(&prompt, attachment);
        self.conversation.push(
            Message::user(prompt, image.clone()),
            self.config.session.title_max_chars,
        );
        self.start_turn(request_prompt, image);
    }

    fn explain_code(&mut self, code: String, language: String) -> Result<()> {
        self.require_code_actions()?;
        self.check_can_request()?;
        self.silence_voice();
        self.previews.clear();
        let prompt = format!(
            "Please explain the following {language} code snippet. Describe its functionality, \
             its logic, and what each major part of the code does:\n\n```{language}\n{code}\n```"
        );
        self.conversation.push(
            Message::user(format!("Explain this {language} code snippet."), None),
            self.config.session.title_max_chars,
        );
        self.start_turn(prompt, None);
        Ok(())
    }

    fn complete_onboarding(&mut self, answers: &MoneyOnboarding) -> Result<()> {
        if !self.conversation.is_onboarding_pending() {
            return Err(AgentError::Unsupported(
                "onboarding is not pending for this conversation".to_owned(),
            ));
        }
        self.check_can_request()?;
        self.conversation.persona.record_onboarding(answers);
        self.silence_voice();
        self.previews.clear();
        self.conversation.replace_messages(
            vec![Message::user(ONBOARDING_COMPLETE_MESSAGE, None)],
            Some(OnboardingState::Complete),
            self.config.session.title_max_chars,
        );
        info!(conversation = %self.conversation.id, "onboarding complete");
        self.start_turn(answers.assessment_prompt(), None);
        Ok(())
    }

    /// Append the assistant placeholder and open the request on its own task.
    fn start_turn(&mut self, prompt: String, image: Option<ImageAttachment>) {
        self.error = None;
        self.next_turn += 1;
        let turn = self.next_turn;
        let grounded = self.conversation.persona.is_grounded();

        let placeholder = Message::placeholder(if grounded {
            self.config.session.searching_placeholder.clone()
        } else {
            String::new()
        });
        let message_id = placeholder.id;
        self.conversation
            .push(placeholder, self.config.session.title_max_chars);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let completions = Arc::clone(&self.services.completions);
        let tx = self.turn_tx.clone();

        if grounded {
            tokio::spawn(async move {
                let result = tokio::select! {
                    () = task_cancel.cancelled() => return,
                    result = completions.grounded(&prompt) => result,
                };
                let kind = match result {
                    Ok(answer) => TurnEventKind::Grounded {
                        text: answer.text,
                        sources: answer.sources,
                    },
                    Err(e) => TurnEventKind::Failed(e.to_string()),
                };
                let _ = tx.send(TurnEvent::new(turn, kind)).await;
            });
        } else {
            let request = CompletionRequest::new(prompt, self.conversation.persona.clone())
                .with_image(image);
            tokio::spawn(async move {
                let opened = tokio::select! {
                    () = task_cancel.cancelled() => return,
                    opened = completions.stream(request) => opened,
                };
                match opened {
                    Ok(stream) => pump_fragments(turn, stream, tx, task_cancel).await,
                    Err(e) => {
                        let _ = tx
                            .send(TurnEvent::new(turn, TurnEventKind::Failed(e.to_string())))
                            .await;
                    }
                }
            });
        }

        info!(
            conversation = %self.conversation.id,
            turn,
            message = %message_id,
            grounded,
            "request dispatched"
        );
        self.active = Some(ActiveTurn {
            turn,
            message_id,
            accumulator: StreamingTextAccumulator::new(),
            cancel,
            mode_at_submit: self.mode,
        });
        self.publish();
    }

    fn handle_turn_event(&mut self, event: TurnEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.turn != event.turn {
            debug!(turn = event.turn, active = active.turn, "stale turn event dropped");
            return;
        }

        match event.kind {
            TurnEventKind::Fragment(fragment) => {
                let text = active.accumulator.push(&fragment).to_owned();
                let message_id = active.message_id;
                if let Some(message) = self.conversation.message_mut(message_id) {
                    message.text.clone_from(&text);
                }
                self.refresh_live_preview(message_id, &text);
                self.publish();
            }
            TurnEventKind::Grounded { text, sources } => {
                active.accumulator.push(&text);
                active.accumulator.finish();
                self.finish_turn(sources);
            }
            TurnEventKind::Finished => {
                active.accumulator.finish();
                self.finish_turn(Vec::new());
            }
            TurnEventKind::Failed(message) => {
                warn!(conversation = %self.conversation.id, turn = event.turn, error = %message, "request failed");
                active.accumulator.fail(message);
                self.finish_turn(Vec::new());
            }
        }
    }

    /// Finalize the streaming message and hand it to speech output if due.
    fn finish_turn(&mut self, sources: Vec<GroundingSource>) {
        let Some(ActiveTurn {
            message_id,
            accumulator,
            cancel,
            mode_at_submit,
            ..
        }) = self.active.take()
        else {
            return;
        };
        cancel.cancel();
        if let Some(error) = accumulator.error() {
            self.error = Some(error.to_owned());
        }
        let text = accumulator.into_text();
        if let Some(message) = self.conversation.message_mut(message_id) {
            message.text.clone_from(&text);
            message.sources = sources;
            message.streaming = false;
        }
        self.refresh_live_preview(message_id, &text);
        info!(
            conversation = %self.conversation.id,
            message = %message_id,
            chars = text.chars().count(),
            "response finalized"
        );

        let speak_mode = match self.config.session.speak_policy {
            SpeakPolicy::RecheckMode => self.mode,
            SpeakPolicy::ModeAtSubmit => mode_at_submit,
        };
        if speak_mode == InteractionMode::HandsFree && !text.trim().is_empty() {
            self.speak(&text, UtteranceId::message(self.conversation.id, message_id));
        }
        self.publish();
    }

    fn refresh_live_preview(&mut self, message_id: MessageId, text: &str) {
        if !self.conversation.persona.supports_code_actions() {
            return;
        }
        if let Some(block) = fence::latest_preview(text) {
            self.previews.insert(
                message_id,
                Preview {
                    message_id,
                    code: block.code,
                },
            );
        }
    }

    // ── Code actions and settings ────────────────────────────

    fn require_code_actions(&self) -> Result<()> {
        if self.conversation.persona.supports_code_actions() {
            Ok(())
        } else {
            Err(AgentError::Unsupported(format!(
                "code actions are not available for {}",
                self.conversation.persona.id()
            )))
        }
    }

    fn preview_code(&mut self, message_id: MessageId, code: String, language: String) -> Result<bool> {
        self.require_code_actions()?;
        if self.conversation.message(message_id).is_none() {
            return Err(AgentError::UnknownMessage(message_id.to_string()));
        }
        if !fence::is_previewable_language(&language) {
            return Ok(false);
        }
        self.previews
            .insert(message_id, Preview { message_id, code });
        self.publish();
        Ok(true)
    }

    fn update_setting(&mut self, key: &str, value: &str) -> Result<()> {
        self.conversation.persona.apply_setting(key, value)?;
        info!(conversation = %self.conversation.id, key, value, "setting updated");
        self.publish();
        Ok(())
    }

    // ── Voice ────────────────────────────────────────────────

    /// Stop speech and abandon capture before a new request.
    fn silence_voice(&mut self) {
        self.services.voice_output.stop();
        self.services.voice_input.cancel_for(self.conversation.id);
        self.capture = None;
        self.caption = None;
        self.draft.clear();
    }

    fn speak(&mut self, text: &str, id: UtteranceId) -> SpeakOutcome {
        if self.services.voice_input.cancel_for(self.conversation.id) {
            self.capture = None;
        }
        let outcome = self.services.voice_output.speak(text, id.clone());
        self.caption = match outcome {
            SpeakOutcome::Started => Some(CaptionState::new(id, text)),
            SpeakOutcome::Stopped | SpeakOutcome::Failed => None,
        };
        outcome
    }

    fn cancel_active_speech(&mut self) -> bool {
        let stopped = self.services.voice_output.stop();
        self.caption = None;
        self.publish();
        stopped
    }

    fn read_aloud(&mut self, message_id: MessageId) -> Result<SpeakOutcome> {
        let text = self
            .conversation
            .message(message_id)
            .map(|m| m.text.clone())
            .ok_or_else(|| AgentError::UnknownMessage(message_id.to_string()))?;
        let outcome = self.speak(&text, UtteranceId::message(self.conversation.id, message_id));
        self.publish();
        Ok(outcome)
    }

    fn toggle_hands_free(&mut self) -> InteractionMode {
        match self.mode {
            InteractionMode::Idle => {
                self.mode = InteractionMode::HandsFree;
                info!(conversation = %self.conversation.id, "hands-free call started");
                self.services.voice_output.play_connect_tone();
                let greeting = self.config.voice.greeting.clone();
                self.speak(&greeting, UtteranceId::greeting(self.conversation.id));
            }
            InteractionMode::HandsFree => {
                self.mode = InteractionMode::Idle;
                info!(conversation = %self.conversation.id, "hands-free call ended");
                self.services.voice_output.stop();
                self.services.voice_input.stop_for(self.conversation.id);
                self.caption = None;
            }
        }
        self.publish();
        self.mode
    }

    fn start_listening(&mut self) {
        self.services.voice_output.stop();
        self.caption = None;
        self.draft.clear();
        self.capture = match self.services.voice_input.start(self.conversation.id) {
            Ok(capture) => Some(capture),
            Err(e) => {
                warn!(conversation = %self.conversation.id, error = %e, "could not start listening");
                None
            }
        };
        self.publish();
    }

    fn handle_output_event(&mut self, event: VoiceOutputEvent) {
        if event.id().owner != self.conversation.id {
            return;
        }
        match event {
            VoiceOutputEvent::Started { id, text } => {
                let playing = self.services.voice_output.current().as_ref() == Some(&id);
                let shown = self.caption.as_ref().is_some_and(|c| c.utterance == id);
                if playing && !shown {
                    self.caption = Some(CaptionState::new(id, text));
                }
            }
            VoiceOutputEvent::Progress { id, char_index } => {
                if let Some(caption) = self.caption.as_mut()
                    && caption.utterance == id
                {
                    caption.highlight_offset = char_index;
                }
            }
            VoiceOutputEvent::Ended { id, interrupted } => {
                self.clear_caption_for(&id);
                if !interrupted
                    && self.mode == InteractionMode::HandsFree
                    && self.config.voice.auto_listen
                    && self.active.is_none()
                    && self.services.voice_output.current().is_none()
                {
                    debug!(conversation = %self.conversation.id, utterance = %id, "auto-listen after utterance");
                    self.start_listening();
                    return;
                }
            }
            VoiceOutputEvent::Failed { id, .. } => self.clear_caption_for(&id),
        }
        self.publish();
    }

    fn clear_caption_for(&mut self, id: &UtteranceId) {
        if self.caption.as_ref().is_some_and(|c| &c.utterance == id) {
            self.caption = None;
        }
    }

    fn handle_input_event(&mut self, event: VoiceInputEvent) {
        if event.owner() != self.conversation.id {
            return;
        }
        let capture = event.capture();
        let current = capture.is_some() && capture == self.capture;
        match event {
            VoiceInputEvent::ListeningChanged { .. } => {}
            VoiceInputEvent::Draft { .. }
            | VoiceInputEvent::Ended { .. }
            | VoiceInputEvent::Failed { .. }
                if !current =>
            {
                debug!(conversation = %self.conversation.id, capture = ?capture, "stale capture event dropped");
                return;
            }
            VoiceInputEvent::Draft { text, .. } => self.draft = text,
            VoiceInputEvent::Failed { .. } => self.capture = None,
            VoiceInputEvent::Ended { finalized, .. } => {
                self.capture = None;
                if self.mode == InteractionMode::HandsFree && !finalized.trim().is_empty() {
                    info!(conversation = %self.conversation.id, "submitting voice transcript");
                    match self.submit(finalized.clone(), None) {
                        Ok(()) => return,
                        Err(e) if e.is_rejection() => {
                            info!(conversation = %self.conversation.id, error = %e, "voice transcript kept as draft");
                        }
                        Err(e) => {
                            warn!(conversation = %self.conversation.id, error = %e, "voice transcript not submitted");
                        }
                    }
                }
                if !self.draft.starts_with(finalized.as_str()) {
                    self.draft = finalized;
                }
            }
        }
        self.publish();
    }

    // ── Lifecycle ────────────────────────────────────────────

    fn shutdown(&mut self) {
        if let Some(ActiveTurn {
            message_id,
            accumulator,
            cancel,
            ..
        }) = self.active.take()
        {
            cancel.cancel();
            if let Some(message) = self.conversation.message_mut(message_id) {
                message.text = accumulator.into_text();
                message.streaming = false;
            }
        }
        let id = self.conversation.id;
        if self.services.voice_output.is_speaking_for(id) {
            self.services.voice_output.stop();
        }
        self.services.voice_input.cancel_for(id);
        self.capture = None;
        self.caption = None;
        self.mode = InteractionMode::Idle;
        self.publish();
        info!(conversation = %id, "session closed");
    }

    fn publish(&self) {
        let id = self.conversation.id;
        let snapshot = SessionSnapshot {
            conversation: self.conversation.clone(),
            mode: self.mode,
            caption: self.caption.clone(),
            previews: self.previews.clone(),
            error: self.error.clone(),
            draft: self.draft.clone(),
            listening: self.services.voice_input.is_listening_for(id),
            speaking: self.services.voice_output.is_speaking_for(id),
            awaiting_response: self.active.is_some(),
        };
        let _ = self.events.send(snapshot.clone());
        self.snapshots.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::persona::{AgentPersona, CoderSettings, HomeworkSettings, MoneySettings};
    use crate::testing::{FakeRecognizer, FakeSynthesizer, ScriptedCompletions};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        completions: Arc<ScriptedCompletions>,
        synth: Arc<FakeSynthesizer>,
        session: SessionController,
    }

    fn harness(persona: AgentPersona) -> Harness {
        let completions = Arc::new(ScriptedCompletions::new());
        let synth = Arc::new(FakeSynthesizer::new());
        let recognizer = Arc::new(FakeRecognizer::new());
        let config = AgentConfig::default();
        let services = SessionServices {
            completions: completions.clone(),
            voice_output: VoiceOutput::new(synth.clone(), config.voice.clone()).unwrap(),
            voice_input: VoiceInput::new(recognizer, &config.voice).unwrap(),
        };
        let session = SessionController::spawn(Conversation::new(persona), services, config);
        Harness {
            completions,
            synth,
            session,
        }
    }

    async fn wait_for(
        session: &SessionController,
        mut pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = session.watch();
        let snapshot = timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
            .await
            .expect("state reached in time")
            .expect("session alive")
            .clone();
        snapshot
    }

    #[tokio::test]
    async fn image_personas_reject_chat() {
        let h = harness(AgentPersona::ImageEditor);
        let err = h.session.submit("make it blue", None).await.unwrap_err();
        assert!(matches!(err, AgentError::Unsupported(_)));
        assert!(h.session.snapshot().conversation.messages.is_empty());
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let h = harness(AgentPersona::TaskAgent);
        assert!(matches!(
            h.session.submit("   ", None).await,
            Err(AgentError::EmptyPrompt)
        ));
    }

    #[tokio::test]
    async fn second_submit_while_streaming_is_busy() {
        let h = harness(AgentPersona::TaskAgent);
        let driver = h.completions.push_manual();
        h.session.submit("plan my week", None).await.unwrap();
        assert!(matches!(
            h.session.submit("again", None).await,
            Err(AgentError::Busy)
        ));
        driver.send("Monday: rest");
        driver.finish();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        assert_eq!(done.conversation.messages.len(), 2);
        assert_eq!(done.conversation.messages[1].text, "Monday: rest");
    }

    #[tokio::test]
    async fn mismatched_setting_is_a_no_op() {
        let h = harness(AgentPersona::Homework(HomeworkSettings::default()));
        let before = h.session.snapshot().conversation.persona;
        let err = h.session.update_setting("language", "Rust").await.unwrap_err();
        assert!(matches!(err, AgentError::SettingMismatch { .. }));
        assert_eq!(h.session.snapshot().conversation.persona, before);

        h.session.update_setting("grade", "Grade 7").await.unwrap();
        let AgentPersona::Homework(settings) = h.session.snapshot().conversation.persona else {
            unreachable!()
        };
        assert_eq!(settings.grade, "Grade 7");
    }

    #[tokio::test]
    async fn coder_reply_publishes_live_preview() {
        let h = harness(AgentPersona::Coder(CoderSettings::default()));
        let driver = h.completions.push_manual();
        h.session.submit("a button", None).await.unwrap();
        driver.send("Here:\n```html\n<button>");
        let snapshot = wait_for(&h.session, |s| !s.previews.is_empty()).await;
        let preview = snapshot.previews.values().next().unwrap();
        assert_eq!(preview.code, "<button>");

        driver.send("Go</button>\n```");
        driver.finish();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        let message_id = done.conversation.messages[1].id;
        assert_eq!(done.previews[&message_id].code, "<button>Go</button>");
    }

    #[tokio::test]
    async fn code_actions_are_coder_only() {
        let h = harness(AgentPersona::TaskAgent);
        assert!(matches!(
            h.session.explain_code("print(1)", "python").await,
            Err(AgentError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn explain_code_embeds_snippet_in_request() {
        let h = harness(AgentPersona::Coder(CoderSettings::default()));
        h.completions.push_reply(&["It prints one."]);
        h.session.explain_code("print(1)", "python").await.unwrap();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        assert_eq!(
            done.conversation.messages[0].text,
            "Explain this python code snippet."
        );
        let request = &h.completions.requests()[0];
        assert!(request.prompt.contains("```python\nprint(1)\n```"));
    }

    #[tokio::test]
    async fn preview_code_requires_markup() {
        let h = harness(AgentPersona::Coder(CoderSettings::default()));
        h.completions.push_reply(&["```css\nbody{}\n```"]);
        h.session.submit("style", None).await.unwrap();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        let id = done.conversation.messages[1].id;
        assert!(done.previews.is_empty());

        assert!(!h.session.preview_code(id, "body{}", "css").await.unwrap());
        assert!(h.session.preview_code(id, "<p>x</p>", "HTML").await.unwrap());
        assert_eq!(h.session.snapshot().previews[&id].code, "<p>x</p>");
        assert!(matches!(
            h.session.preview_code(MessageId::next(), "<p/>", "html").await,
            Err(AgentError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn onboarding_replaces_messages_and_requests_assessment() {
        let h = harness(AgentPersona::Money(MoneySettings::default()));
        h.completions.push_reply(&["Not financial advice. Step one: ..."]);
        h.session
            .complete_onboarding(MoneyOnboarding::default())
            .await
            .unwrap();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        assert_eq!(done.conversation.onboarding, Some(OnboardingState::Complete));
        assert_eq!(done.conversation.messages[0].text, ONBOARDING_COMPLETE_MESSAGE);
        assert_eq!(done.conversation.title, "New Alpha Investor Chat");
        assert!(h.completions.requests()[0]
            .prompt
            .starts_with("My financial situation is as follows"));
        assert!(matches!(
            h.session.complete_onboarding(MoneyOnboarding::default()).await,
            Err(AgentError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn read_aloud_toggles() {
        let h = harness(AgentPersona::TaskAgent);
        h.completions.push_reply(&["Step one."]);
        h.session.submit("plan", None).await.unwrap();
        let done = wait_for(&h.session, |s| !s.awaiting_response).await;
        let id = done.conversation.messages[1].id;

        assert_eq!(h.session.read_aloud(id).await.unwrap(), SpeakOutcome::Started);
        let speaking = h.session.snapshot();
        assert!(speaking.speaking);
        assert_eq!(speaking.caption.map(|c| c.text), Some("Step one.".to_owned()));

        assert_eq!(h.session.read_aloud(id).await.unwrap(), SpeakOutcome::Stopped);
        let stopped = h.session.snapshot();
        assert!(!stopped.speaking);
        assert!(stopped.caption.is_none());
        assert_eq!(h.synth.spoken(), vec!["Step one.".to_owned()]);
    }

    #[tokio::test]
    async fn shutdown_finalizes_in_flight_message() {
        let h = harness(AgentPersona::TaskAgent);
        let driver = h.completions.push_manual();
        h.session.submit("plan", None).await.unwrap();
        driver.send("partial");
        wait_for(&h.session, |s| {
            s.streaming_message().is_some_and(|m| m.text == "partial")
        })
        .await;
        h.session.shutdown().await.unwrap();
        let last = h.session.snapshot();
        assert_eq!(last.conversation.streaming_count(), 0);
        assert_eq!(last.conversation.messages[1].text, "partial");
        assert!(matches!(
            h.session.submit("more", None).await,
            Err(AgentError::Closed)
        ));
    }
}
