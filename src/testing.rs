//! In-memory collaborators for tests and demos.
//!
//! [`ScriptedCompletions`] replays queued replies; [`FakeSynthesizer`] and
//! [`FakeRecognizer`] record commands and let the caller inject engine events.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{AgentError, Result};
use crate::provider::{CompletionRequest, CompletionService, GroundedAnswer};
use crate::stream::FragmentStream;
use crate::voice::{
    BoundaryKind, RecognizerEvent, RecognizerSink, SpeechRecognizer, SpeechSynthesizer,
    SynthEvent, SynthSink, SynthesisRequest, VoiceInfo,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum ScriptedStream {
    Items(Vec<Result<String>>),
    Manual(mpsc::UnboundedReceiver<Result<String>>),
    Refuse(String),
}

enum ScriptedGrounded {
    Ready(Result<GroundedAnswer>),
    Pending(oneshot::Receiver<Result<GroundedAnswer>>),
}

/// Drives a stream queued with [`ScriptedCompletions::push_manual`].
///
/// Dropping the driver (or calling [`finish`](Self::finish)) ends the stream.
#[derive(Debug)]
pub struct StreamDriver {
    tx: mpsc::UnboundedSender<Result<String>>,
}

impl StreamDriver {
    pub fn send(&self, fragment: &str) {
        let _ = self.tx.send(Ok(fragment.to_owned()));
    }

    pub fn fail(self, message: &str) {
        let _ = self.tx.send(Err(AgentError::Stream(message.to_owned())));
    }

    pub fn finish(self) {}
}

/// Completion service that replays queued replies in order.
#[derive(Default)]
pub struct ScriptedCompletions {
    streams: Mutex<VecDeque<ScriptedStream>>,
    grounded: Mutex<VecDeque<ScriptedGrounded>>,
    requests: Mutex<Vec<CompletionRequest>>,
    grounded_prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream that yields `fragments` and ends.
    pub fn push_reply(&self, fragments: &[&str]) {
        self.push_items(fragments.iter().map(|f| Ok((*f).to_owned())).collect());
    }

    /// Queue a stream with explicit items, including failures.
    pub fn push_items(&self, items: Vec<Result<String>>) {
        guard(&self.streams).push_back(ScriptedStream::Items(items));
    }

    /// Queue a request that fails before any fragment.
    pub fn push_refusal(&self, message: &str) {
        guard(&self.streams).push_back(ScriptedStream::Refuse(message.to_owned()));
    }

    /// Queue a stream whose fragments are sent by the returned driver.
    pub fn push_manual(&self) -> StreamDriver {
        let (tx, rx) = mpsc::unbounded_channel();
        guard(&self.streams).push_back(ScriptedStream::Manual(rx));
        StreamDriver { tx }
    }

    pub fn push_grounded(&self, answer: GroundedAnswer) {
        guard(&self.grounded).push_back(ScriptedGrounded::Ready(Ok(answer)));
    }

    pub fn push_grounded_error(&self, message: &str) {
        guard(&self.grounded).push_back(ScriptedGrounded::Ready(Err(AgentError::Request(
            message.to_owned(),
        ))));
    }

    /// Queue a grounded answer delivered through the returned sender.
    pub fn push_grounded_pending(&self) -> oneshot::Sender<Result<GroundedAnswer>> {
        let (tx, rx) = oneshot::channel();
        guard(&self.grounded).push_back(ScriptedGrounded::Pending(rx));
        tx
    }

    /// Every streaming request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        guard(&self.requests).clone()
    }

    pub fn grounded_prompts(&self) -> Vec<String> {
        guard(&self.grounded_prompts).clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletions {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream> {
        guard(&self.requests).push(request);
        let next = guard(&self.streams).pop_front();
        match next {
            Some(ScriptedStream::Items(items)) => Ok(Box::pin(futures_util::stream::iter(items))),
            Some(ScriptedStream::Manual(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Some(ScriptedStream::Refuse(message)) => Err(AgentError::Request(message)),
            None => Err(AgentError::Request("no scripted reply".to_owned())),
        }
    }

    async fn grounded(&self, prompt: &str) -> Result<GroundedAnswer> {
        guard(&self.grounded_prompts).push(prompt.to_owned());
        let next = guard(&self.grounded).pop_front();
        match next {
            Some(ScriptedGrounded::Ready(result)) => result,
            Some(ScriptedGrounded::Pending(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(AgentError::Request("grounded reply dropped".to_owned()))),
            None => Err(AgentError::Request("no scripted grounded reply".to_owned())),
        }
    }
}

#[derive(Default)]
struct SynthState {
    sink: Option<SynthSink>,
    voices: Vec<VoiceInfo>,
    spoken: Vec<SynthesisRequest>,
    tones: Vec<(usize, u32)>,
    cancel_count: usize,
    refuse_next: bool,
}

/// Synthesizer that records utterances and emits events on request.
#[derive(Default)]
pub struct FakeSynthesizer {
    state: Mutex<SynthState>,
}

impl FakeSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&self, event: SynthEvent) {
        if let Some(sink) = &guard(&self.state).sink {
            let _ = sink.send(event);
        }
    }

    /// Texts handed to `speak`, in order.
    pub fn spoken(&self) -> Vec<String> {
        guard(&self.state)
            .spoken
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    pub fn last_generation(&self) -> u64 {
        guard(&self.state)
            .spoken
            .last()
            .map_or(0, |r| r.generation)
    }

    pub fn last_voice(&self) -> Option<VoiceInfo> {
        guard(&self.state).spoken.last().and_then(|r| r.voice.clone())
    }

    pub fn cancel_count(&self) -> usize {
        guard(&self.state).cancel_count
    }

    /// `(sample count, sample rate)` of every tone played.
    pub fn tones(&self) -> Vec<(usize, u32)> {
        guard(&self.state).tones.clone()
    }

    pub fn set_voices(&self, voices: Vec<VoiceInfo>) {
        guard(&self.state).voices = voices;
    }

    pub fn refuse_next_utterance(&self) {
        guard(&self.state).refuse_next = true;
    }

    pub fn announce_voices_changed(&self) {
        self.send(SynthEvent::VoicesChanged);
    }

    pub fn boundary(&self, generation: u64, kind: BoundaryKind, char_index: usize) {
        self.send(SynthEvent::Boundary {
            generation,
            kind,
            char_index,
        });
    }

    pub fn finish(&self, generation: u64) {
        self.send(SynthEvent::Finished { generation });
    }

    /// Finish the most recent utterance.
    pub fn finish_current(&self) {
        self.finish(self.last_generation());
    }

    pub fn fail(&self, generation: u64, message: &str) {
        self.send(SynthEvent::Failed {
            generation,
            message: message.to_owned(),
        });
    }
}

impl SpeechSynthesizer for FakeSynthesizer {
    fn attach(&self, sink: SynthSink) -> Result<()> {
        guard(&self.state).sink = Some(sink);
        Ok(())
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        guard(&self.state).voices.clone()
    }

    fn speak(&self, request: SynthesisRequest) -> Result<()> {
        let mut state = guard(&self.state);
        if std::mem::take(&mut state.refuse_next) {
            return Err(AgentError::Voice("synthesizer unavailable".to_owned()));
        }
        state.spoken.push(request);
        Ok(())
    }

    fn cancel(&self) {
        guard(&self.state).cancel_count += 1;
    }

    fn play_tone(&self, samples: &[f32], sample_rate: u32) -> Result<()> {
        guard(&self.state).tones.push((samples.len(), sample_rate));
        Ok(())
    }
}

#[derive(Default)]
struct RecognizerState {
    sink: Option<RecognizerSink>,
    generation: u64,
    locale: Option<String>,
    begin_count: usize,
    end_count: usize,
    refuse_next: bool,
}

/// Recognizer that records commands and emits transcripts on request.
#[derive(Default)]
pub struct FakeRecognizer {
    state: Mutex<RecognizerState>,
}

impl FakeRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&self, event: RecognizerEvent) {
        if let Some(sink) = &guard(&self.state).sink {
            let _ = sink.send(event);
        }
    }

    pub fn last_generation(&self) -> u64 {
        guard(&self.state).generation
    }

    pub fn last_locale(&self) -> Option<String> {
        guard(&self.state).locale.clone()
    }

    pub fn begin_count(&self) -> usize {
        guard(&self.state).begin_count
    }

    pub fn end_count(&self) -> usize {
        guard(&self.state).end_count
    }

    pub fn refuse_next_start(&self) {
        guard(&self.state).refuse_next = true;
    }

    /// Emit a recognition batch for the latest capture.
    pub fn result(&self, finalized: &str, interim: &str) {
        self.result_for(self.last_generation(), finalized, interim);
    }

    pub fn result_for(&self, generation: u64, finalized: &str, interim: &str) {
        self.send(RecognizerEvent::Result {
            generation,
            finalized: finalized.to_owned(),
            interim: interim.to_owned(),
        });
    }

    /// End the latest capture as if silence was detected.
    pub fn end_naturally(&self) {
        self.send(RecognizerEvent::Ended {
            generation: self.last_generation(),
        });
    }

    pub fn fail(&self, message: &str) {
        self.send(RecognizerEvent::Failed {
            generation: self.last_generation(),
            message: message.to_owned(),
        });
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn attach(&self, sink: RecognizerSink) -> Result<()> {
        guard(&self.state).sink = Some(sink);
        Ok(())
    }

    fn begin(&self, generation: u64, locale: &str) -> Result<()> {
        let mut state = guard(&self.state);
        if std::mem::take(&mut state.refuse_next) {
            return Err(AgentError::Voice("microphone unavailable".to_owned()));
        }
        state.generation = generation;
        state.locale = Some(locale.to_owned());
        state.begin_count += 1;
        Ok(())
    }

    fn end(&self) {
        guard(&self.state).end_count += 1;
    }
}
