//! Speech capture service handle.
//!
//! One capture session runs process-wide and belongs to an owner
//! (a conversation id). Transcript batches build a draft of
//! `finalized + interim`; when capture ends the owner receives the finalized
//! transcript.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RecognizerEvent, SpeechRecognizer};
use crate::config::VoiceConfig;
use crate::error::{AgentError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceInputEvent {
    ListeningChanged { owner: Uuid, listening: bool },
    /// Current `finalized + interim` transcript of capture `capture`.
    Draft {
        owner: Uuid,
        capture: u64,
        text: String,
    },
    /// Capture ended. `finalized` is empty when the capture was cancelled.
    Ended {
        owner: Uuid,
        capture: u64,
        finalized: String,
    },
    Failed {
        owner: Uuid,
        capture: u64,
        message: String,
    },
}

impl VoiceInputEvent {
    pub fn owner(&self) -> Uuid {
        match self {
            Self::ListeningChanged { owner, .. }
            | Self::Draft { owner, .. }
            | Self::Ended { owner, .. }
            | Self::Failed { owner, .. } => *owner,
        }
    }

    /// Capture the event belongs to, if it is tied to one.
    pub fn capture(&self) -> Option<u64> {
        match self {
            Self::ListeningChanged { .. } => None,
            Self::Draft { capture, .. }
            | Self::Ended { capture, .. }
            | Self::Failed { capture, .. } => Some(*capture),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    owner: Uuid,
    generation: u64,
}

#[derive(Debug, Default)]
struct InputState {
    generation: u64,
    capture: Option<Capture>,
    finalized: String,
    interim: String,
}

impl InputState {
    fn draft(&self) -> String {
        format!("{}{}", self.finalized, self.interim)
    }

    fn clear(&mut self) {
        self.finalized.clear();
        self.interim.clear();
    }

    /// Close the active capture, returning it.
    fn close(&mut self) -> Option<Capture> {
        let capture = self.capture.take()?;
        self.generation += 1;
        self.interim.clear();
        Some(capture)
    }
}

struct Inner {
    engine: Arc<dyn SpeechRecognizer>,
    locale: String,
    state: Mutex<InputState>,
    events: broadcast::Sender<VoiceInputEvent>,
    cancel: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: VoiceInputEvent) {
        let _ = self.events.send(event);
    }

    fn emit_ended(&self, capture: Capture, finalized: String) {
        self.emit(VoiceInputEvent::ListeningChanged {
            owner: capture.owner,
            listening: false,
        });
        self.emit(VoiceInputEvent::Ended {
            owner: capture.owner,
            capture: capture.generation,
            finalized,
        });
    }

    fn handle_engine_event(&self, event: RecognizerEvent) {
        let mut state = self.state();
        let generation = match &event {
            RecognizerEvent::Result { generation, .. }
            | RecognizerEvent::Ended { generation }
            | RecognizerEvent::Failed { generation, .. } => *generation,
        };
        let Some(capture) = state.capture else {
            return;
        };
        if capture.generation != generation {
            debug!(generation, "stale recognizer event dropped");
            return;
        }

        match event {
            RecognizerEvent::Result {
                finalized, interim, ..
            } => {
                state.finalized.push_str(&finalized);
                state.interim = interim;
                let text = state.draft();
                drop(state);
                self.emit(VoiceInputEvent::Draft {
                    owner: capture.owner,
                    capture: capture.generation,
                    text,
                });
            }
            RecognizerEvent::Ended { .. } => {
                state.close();
                let finalized = state.finalized.clone();
                drop(state);
                info!(owner = %capture.owner, chars = finalized.len(), "capture ended");
                self.emit_ended(capture, finalized);
            }
            RecognizerEvent::Failed { message, .. } => {
                state.close();
                state.clear();
                drop(state);
                warn!(owner = %capture.owner, error = %message, "speech recognition failed");
                self.emit(VoiceInputEvent::ListeningChanged {
                    owner: capture.owner,
                    listening: false,
                });
                self.emit(VoiceInputEvent::Failed {
                    owner: capture.owner,
                    capture: capture.generation,
                    message,
                });
            }
        }
    }
}

/// Cloneable handle to the speech capture service.
#[derive(Clone)]
pub struct VoiceInput {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VoiceInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceInput")
            .field("listening", &self.listening_owner())
            .finish()
    }
}

impl VoiceInput {
    /// Attach to `engine` and start the engine event task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if it refuses the event sink.
    pub fn new(engine: Arc<dyn SpeechRecognizer>, config: &VoiceConfig) -> Result<Self> {
        let (sink, mut rx) = mpsc::unbounded_channel();
        engine.attach(sink)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            engine,
            locale: config.fallback_locale.clone(),
            state: Mutex::new(InputState::default()),
            events,
            cancel: CancellationToken::new(),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_inner.cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => task_inner.handle_engine_event(event),
                        None => break,
                    },
                }
            }
            debug!("voice input event task stopped");
        });

        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceInputEvent> {
        self.inner.events.subscribe()
    }

    /// Owner of the active capture.
    pub fn listening_owner(&self) -> Option<Uuid> {
        self.inner.state().capture.map(|c| c.owner)
    }

    pub fn is_listening_for(&self, owner: Uuid) -> bool {
        self.listening_owner() == Some(owner)
    }

    /// `finalized + interim` transcript of the latest capture.
    pub fn draft(&self) -> String {
        self.inner.state().draft()
    }

    /// Start capturing for `owner`, clearing the draft. Returns the capture
    /// number carried by this capture's events.
    ///
    /// Any other capture is cancelled first; its owner receives `Ended` with
    /// an empty transcript.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Voice`] if the engine cannot start. The service
    /// is idle afterwards and a `Failed` event is broadcast.
    pub fn start(&self, owner: Uuid) -> Result<u64> {
        let mut state = self.inner.state();
        let previous = state.close();
        if previous.is_some() {
            self.inner.engine.end();
        }
        state.clear();
        state.generation += 1;
        let generation = state.generation;
        let started = self.inner.engine.begin(generation, &self.inner.locale);
        if started.is_ok() {
            state.capture = Some(Capture { owner, generation });
        }
        drop(state);

        if let Some(previous) = previous {
            debug!(previous = %previous.owner, owner = %owner, "capture pre-empted");
            self.inner.emit_ended(previous, String::new());
        }
        match started {
            Ok(()) => {
                info!(owner = %owner, capture = generation, "listening");
                self.inner.emit(VoiceInputEvent::ListeningChanged {
                    owner,
                    listening: true,
                });
                Ok(generation)
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "recognizer refused to start");
                self.inner.emit(VoiceInputEvent::Failed {
                    owner,
                    capture: generation,
                    message: e.to_string(),
                });
                Err(AgentError::Voice(e.to_string()))
            }
        }
    }

    /// Stop the active capture, delivering its finalized transcript.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state();
        let Some(capture) = state.close() else {
            return false;
        };
        self.inner.engine.end();
        let finalized = state.finalized.clone();
        drop(state);
        self.inner.emit_ended(capture, finalized);
        true
    }

    /// Stop the capture only if `owner` holds it.
    pub fn stop_for(&self, owner: Uuid) -> bool {
        self.is_listening_for(owner) && self.stop()
    }

    /// Abandon `owner`'s capture without delivering a transcript.
    pub fn cancel_for(&self, owner: Uuid) -> bool {
        let mut state = self.inner.state();
        if state.capture.map(|c| c.owner) != Some(owner) {
            return false;
        }
        let Some(capture) = state.close() else {
            return false;
        };
        state.clear();
        self.inner.engine.end();
        drop(state);
        self.inner.emit_ended(capture, String::new());
        true
    }

    /// Stop capture and the engine event task.
    pub fn shutdown(&self) {
        if let Some(owner) = self.listening_owner() {
            self.cancel_for(owner);
        }
        self.inner.cancel.cancel();
        self.inner.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::testing::FakeRecognizer;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> (Arc<FakeRecognizer>, VoiceInput) {
        let engine = Arc::new(FakeRecognizer::new());
        let input = VoiceInput::new(engine.clone(), &VoiceConfig::default()).unwrap();
        (engine, input)
    }

    async fn next_event(rx: &mut broadcast::Receiver<VoiceInputEvent>) -> VoiceInputEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn next_ended(rx: &mut broadcast::Receiver<VoiceInputEvent>) -> (Uuid, String) {
        loop {
            if let VoiceInputEvent::Ended {
                owner, finalized, ..
            } = next_event(rx).await
            {
                return (owner, finalized);
            }
        }
    }

    #[tokio::test]
    async fn draft_is_finalized_plus_interim() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        let capture = input.start(owner).unwrap();
        let mut rx = input.subscribe();

        engine.result("What is ", "two");
        assert_eq!(
            next_event(&mut rx).await,
            VoiceInputEvent::Draft {
                owner,
                capture,
                text: "What is two".into()
            }
        );
        engine.result("two plus two", "");
        assert_eq!(
            next_event(&mut rx).await,
            VoiceInputEvent::Draft {
                owner,
                capture,
                text: "What is two plus two".into()
            }
        );
        assert_eq!(engine.last_locale().as_deref(), Some("en-US"));
    }

    #[tokio::test]
    async fn natural_end_delivers_finalized_only() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        input.start(owner).unwrap();
        let mut rx = input.subscribe();
        engine.result("hello", " wor");
        engine.end_naturally();
        assert_eq!(next_ended(&mut rx).await, (owner, "hello".to_owned()));
        assert!(input.listening_owner().is_none());
        assert_eq!(input.draft(), "hello");
    }

    #[tokio::test]
    async fn starting_clears_previous_draft() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        input.start(owner).unwrap();
        engine.result("old text", "");
        timeout(Duration::from_secs(2), async {
            while input.draft().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        input.stop();
        input.start(owner).unwrap();
        assert_eq!(input.draft(), "");
    }

    #[tokio::test]
    async fn other_owner_preempts_capture() {
        let (_engine, input) = setup();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        input.start(first).unwrap();
        let mut rx = input.subscribe();
        input.start(second).unwrap();
        assert_eq!(next_ended(&mut rx).await, (first, String::new()));
        assert!(input.is_listening_for(second));
        assert!(!input.stop_for(first));
        assert!(input.stop_for(second));
    }

    #[tokio::test]
    async fn stale_results_after_stop_are_ignored() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        input.start(owner).unwrap();
        let stale = engine.last_generation();
        input.cancel_for(owner);
        engine.result_for(stale, "late", "");
        input.start(owner).unwrap();
        engine.result("fresh", "");
        let mut rx = input.subscribe();
        engine.end_naturally();
        assert_eq!(next_ended(&mut rx).await, (owner, "fresh".to_owned()));
    }

    #[tokio::test]
    async fn engine_failure_resets_to_idle() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        input.start(owner).unwrap();
        let mut rx = input.subscribe();
        engine.fail("no microphone");
        loop {
            if let VoiceInputEvent::Failed { message, .. } = next_event(&mut rx).await {
                assert_eq!(message, "no microphone");
                break;
            }
        }
        assert!(input.listening_owner().is_none());

        engine.refuse_next_start();
        assert!(matches!(input.start(owner), Err(AgentError::Voice(_))));
        assert!(input.listening_owner().is_none());
    }

    #[tokio::test]
    async fn events_carry_their_capture_number() {
        let (engine, input) = setup();
        let owner = Uuid::new_v4();
        let first = input.start(owner).unwrap();
        let mut rx = input.subscribe();
        let second = input.start(owner).unwrap();
        assert_ne!(first, second);
        loop {
            if let VoiceInputEvent::Ended { capture, finalized, .. } = next_event(&mut rx).await {
                assert_eq!(capture, first);
                assert!(finalized.is_empty());
                break;
            }
        }
        engine.result("later", "");
        loop {
            let event = next_event(&mut rx).await;
            if matches!(event, VoiceInputEvent::Draft { .. }) {
                assert_eq!(event.capture(), Some(second));
                break;
            }
        }
    }
}
