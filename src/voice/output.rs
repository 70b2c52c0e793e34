//! Speech output service handle.
//!
//! At most one utterance plays process-wide. Starting a new one cancels the
//! current one; asking to speak the utterance that is already playing stops
//! it instead. Every state change is broadcast as a [`VoiceOutputEvent`].

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::selection::{VoiceInfo, select_voice};
use super::tone::render_tone;
use super::{BoundaryKind, SpeechSynthesizer, SynthEvent, SynthesisRequest, UtteranceId};
use crate::config::VoiceConfig;
use crate::error::Result;

const EVENT_CAPACITY: usize = 64;

/// Observable speech output activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceOutputEvent {
    Started { id: UtteranceId, text: String },
    /// Sentence boundary reached; `char_index` is a byte offset into the text.
    Progress { id: UtteranceId, char_index: usize },
    Ended { id: UtteranceId, interrupted: bool },
    Failed { id: UtteranceId, message: String },
}

impl VoiceOutputEvent {
    pub fn id(&self) -> &UtteranceId {
        match self {
            Self::Started { id, .. }
            | Self::Progress { id, .. }
            | Self::Ended { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }
}

/// Result of [`VoiceOutput::speak`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Started,
    /// The id was already playing and has been stopped.
    Stopped,
    /// The engine refused the utterance; output is idle.
    Failed,
}

#[derive(Debug)]
struct Utterance {
    id: UtteranceId,
    generation: u64,
}

#[derive(Debug, Default)]
struct OutputState {
    generation: u64,
    current: Option<Utterance>,
    voice: Option<VoiceInfo>,
    voice_loaded: bool,
}

struct Inner {
    engine: Arc<dyn SpeechSynthesizer>,
    config: VoiceConfig,
    state: Mutex<OutputState>,
    events: broadcast::Sender<VoiceOutputEvent>,
    cancel: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: VoiceOutputEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_voice(&self, state: &mut OutputState) {
        let voices = self.engine.voices();
        state.voice = select_voice(
            &voices,
            &self.config.preferred_language,
            &self.config.fallback_locale,
        );
        // An empty list is retried on the next utterance.
        state.voice_loaded = !voices.is_empty();
        debug!(voice = ?state.voice.as_ref().map(|v| &v.name), "voice selection refreshed");
    }

    /// Cancel the current utterance, if any. Caller holds the state lock.
    fn interrupt(&self, state: &mut OutputState) -> Option<UtteranceId> {
        let current = state.current.take()?;
        state.generation += 1;
        self.engine.cancel();
        Some(current.id)
    }

    fn handle_engine_event(&self, event: SynthEvent) {
        let mut state = self.state();
        let (generation, outcome) = match event {
            SynthEvent::VoicesChanged => {
                self.refresh_voice(&mut state);
                return;
            }
            SynthEvent::Boundary {
                generation,
                kind,
                char_index,
            } => {
                if kind != BoundaryKind::Sentence {
                    return;
                }
                (generation, EngineOutcome::Progress(char_index))
            }
            SynthEvent::Finished { generation } => (generation, EngineOutcome::Finished),
            SynthEvent::Failed {
                generation,
                message,
            } => (generation, EngineOutcome::Failed(message)),
        };

        let Some(current) = state.current.as_ref() else {
            return;
        };
        if current.generation != generation {
            debug!(generation, current = current.generation, "stale synthesizer event dropped");
            return;
        }
        let id = current.id.clone();
        match outcome {
            EngineOutcome::Progress(char_index) => {
                drop(state);
                self.emit(VoiceOutputEvent::Progress { id, char_index });
            }
            EngineOutcome::Finished => {
                state.current = None;
                drop(state);
                debug!(utterance = %id, "utterance finished");
                self.emit(VoiceOutputEvent::Ended {
                    id,
                    interrupted: false,
                });
            }
            EngineOutcome::Failed(message) => {
                state.current = None;
                drop(state);
                warn!(utterance = %id, error = %message, "speech synthesis failed");
                self.emit(VoiceOutputEvent::Failed { id, message });
            }
        }
    }
}

enum EngineOutcome {
    Progress(usize),
    Finished,
    Failed(String),
}

/// Cloneable handle to the speech output service.
#[derive(Clone)]
pub struct VoiceOutput {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VoiceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceOutput")
            .field("current", &self.current())
            .finish()
    }
}

impl VoiceOutput {
    /// Attach to `engine` and start the engine event task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if it refuses the event sink.
    pub fn new(engine: Arc<dyn SpeechSynthesizer>, config: VoiceConfig) -> Result<Self> {
        let (sink, mut rx) = mpsc::unbounded_channel();
        engine.attach(sink)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            engine,
            config,
            state: Mutex::new(OutputState::default()),
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
            debug!("voice output event task stopped");
        });

        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceOutputEvent> {
        self.inner.events.subscribe()
    }

    /// The utterance currently playing.
    pub fn current(&self) -> Option<UtteranceId> {
        self.inner.state().current.as_ref().map(|u| u.id.clone())
    }

    /// Whether an utterance owned by `owner` is playing.
    pub fn is_speaking_for(&self, owner: Uuid) -> bool {
        self.inner
            .state()
            .current
            .as_ref()
            .is_some_and(|u| u.id.owner == owner)
    }

    /// The cached voice, selecting one on first use.
    pub fn selected_voice(&self) -> Option<VoiceInfo> {
        let mut state = self.inner.state();
        if !state.voice_loaded {
            self.inner.refresh_voice(&mut state);
        }
        state.voice.clone()
    }

    /// Speak `text` as utterance `id`, or stop it if `id` is already playing.
    pub fn speak(&self, text: &str, id: UtteranceId) -> SpeakOutcome {
        let mut state = self.inner.state();

        if state.current.as_ref().is_some_and(|u| u.id == id) {
            self.inner.interrupt(&mut state);
            drop(state);
            debug!(utterance = %id, "utterance toggled off");
            self.inner.emit(VoiceOutputEvent::Ended {
                id,
                interrupted: true,
            });
            return SpeakOutcome::Stopped;
        }

        let previous = self.inner.interrupt(&mut state);
        if !state.voice_loaded {
            self.inner.refresh_voice(&mut state);
        }
        state.generation += 1;
        let generation = state.generation;
        let request = SynthesisRequest {
            generation,
            text: text.to_owned(),
            voice: state.voice.clone(),
        };

        let result = self.inner.engine.speak(request);
        if result.is_ok() {
            state.current = Some(Utterance {
                id: id.clone(),
                generation,
            });
        }
        drop(state);

        if let Some(previous) = previous {
            self.inner.emit(VoiceOutputEvent::Ended {
                id: previous,
                interrupted: true,
            });
        }
        match result {
            Ok(()) => {
                info!(utterance = %id, chars = text.chars().count(), "speaking");
                self.inner.emit(VoiceOutputEvent::Started {
                    id,
                    text: text.to_owned(),
                });
                SpeakOutcome::Started
            }
            Err(e) => {
                warn!(utterance = %id, error = %e, "synthesizer refused utterance");
                self.inner.emit(VoiceOutputEvent::Failed {
                    id,
                    message: e.to_string(),
                });
                SpeakOutcome::Failed
            }
        }
    }

    /// Stop whatever is playing. Returns whether anything was stopped.
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut state = self.inner.state();
            self.inner.interrupt(&mut state)
        };
        match stopped {
            Some(id) => {
                debug!(utterance = %id, "utterance stopped");
                self.inner.emit(VoiceOutputEvent::Ended {
                    id,
                    interrupted: true,
                });
                true
            }
            None => false,
        }
    }

    /// Play the hands-free connect tone. Failures are logged only.
    pub fn play_connect_tone(&self) {
        let tone = &self.inner.config.connect_tone;
        let samples = render_tone(tone);
        if let Err(e) = self.inner.engine.play_tone(&samples, tone.sample_rate) {
            warn!(error = %e, "connect tone failed");
        }
    }

    /// Stop playback and the engine event task.
    pub fn shutdown(&self) {
        self.stop();
        self.inner.cancel.cancel();
        self.inner.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::testing::FakeSynthesizer;
    use crate::voice::VoiceQuality;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> (Arc<FakeSynthesizer>, VoiceOutput) {
        let engine = Arc::new(FakeSynthesizer::new());
        let output = VoiceOutput::new(engine.clone(), VoiceConfig::default()).unwrap();
        (engine, output)
    }

    async fn next_event(rx: &mut broadcast::Receiver<VoiceOutputEvent>) -> VoiceOutputEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn same_id_toggles_off() {
        let (engine, output) = setup();
        let id = UtteranceId::new(Uuid::new_v4(), "msg-1");
        assert_eq!(output.speak("Hello there.", id.clone()), SpeakOutcome::Started);
        assert_eq!(output.current(), Some(id.clone()));
        assert_eq!(output.speak("Hello there.", id), SpeakOutcome::Stopped);
        assert!(output.current().is_none());
        assert_eq!(engine.cancel_count(), 1);
    }

    #[tokio::test]
    async fn new_utterance_replaces_current() {
        let (engine, output) = setup();
        let mut rx = output.subscribe();
        let owner = Uuid::new_v4();
        let first = UtteranceId::new(owner, "a");
        let second = UtteranceId::new(owner, "b");
        output.speak("one", first.clone());
        output.speak("two", second.clone());
        assert_eq!(output.current(), Some(second.clone()));

        assert!(matches!(next_event(&mut rx).await, VoiceOutputEvent::Started { id, .. } if id == first));
        assert_eq!(
            next_event(&mut rx).await,
            VoiceOutputEvent::Ended {
                id: first,
                interrupted: true
            }
        );
        assert!(matches!(next_event(&mut rx).await, VoiceOutputEvent::Started { id, .. } if id == second));
        assert_eq!(engine.spoken(), vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn stale_finish_is_ignored() {
        let (engine, output) = setup();
        let owner = Uuid::new_v4();
        output.speak("one", UtteranceId::new(owner, "a"));
        let stale = engine.last_generation();
        output.speak("two", UtteranceId::new(owner, "b"));

        let mut rx = output.subscribe();
        engine.finish(stale);
        engine.finish(engine.last_generation());
        let event = next_event(&mut rx).await;
        assert_eq!(
            event,
            VoiceOutputEvent::Ended {
                id: UtteranceId::new(owner, "b"),
                interrupted: false,
            }
        );
        assert!(output.current().is_none());
    }

    #[tokio::test]
    async fn only_sentence_boundaries_are_reported() {
        let (engine, output) = setup();
        let id = UtteranceId::new(Uuid::new_v4(), "m");
        output.speak("One. Two.", id.clone());
        let mut rx = output.subscribe();
        let generation = engine.last_generation();
        engine.boundary(generation, BoundaryKind::Word, 4);
        engine.boundary(generation, BoundaryKind::Sentence, 5);
        assert_eq!(
            next_event(&mut rx).await,
            VoiceOutputEvent::Progress { id, char_index: 5 }
        );
    }

    #[tokio::test]
    async fn engine_failure_resets_to_idle() {
        let (engine, output) = setup();
        let id = UtteranceId::new(Uuid::new_v4(), "m");
        output.speak("text", id.clone());
        let mut rx = output.subscribe();
        engine.fail(engine.last_generation(), "audio device lost");
        assert!(matches!(next_event(&mut rx).await, VoiceOutputEvent::Failed { id: got, .. } if got == id));
        assert!(output.current().is_none());

        engine.refuse_next_utterance();
        assert_eq!(output.speak("again", id), SpeakOutcome::Failed);
        assert!(output.current().is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (_engine, output) = setup();
        assert!(!output.stop());
        output.speak("x", UtteranceId::new(Uuid::new_v4(), "m"));
        assert!(output.stop());
        assert!(!output.stop());
    }

    #[tokio::test]
    async fn voice_cache_refreshes_on_voice_list_change() {
        let (engine, output) = setup();
        assert!(output.selected_voice().is_none());
        engine.set_voices(vec![VoiceInfo {
            name: "Ava".into(),
            lang: "en-US".into(),
            local: true,
            quality: VoiceQuality::Enhanced,
        }]);
        engine.announce_voices_changed();
        timeout(Duration::from_secs(2), async {
            while output.selected_voice().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        output.speak("hi", UtteranceId::new(Uuid::new_v4(), "m"));
        assert_eq!(engine.last_voice().map(|v| v.name), Some("Ava".to_owned()));
    }

    #[tokio::test]
    async fn connect_tone_is_rendered_to_engine() {
        let (engine, output) = setup();
        output.play_connect_tone();
        assert_eq!(engine.tones(), vec![(12_000, 24_000)]);
    }
}
