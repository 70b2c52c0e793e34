//! Accumulation of one streamed response and the pump that feeds it.
//!
//! A completion stream is drained on the request task by [`pump_fragments`],
//! which forwards every fragment as a [`TurnEvent`] over an mpsc channel. The
//! session actor owns the [`StreamingTextAccumulator`] and applies events in
//! arrival order, dropping any whose turn number is stale.

use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conversation::GroundingSource;
use crate::error::Result;

/// Lazy, finite, non-restartable stream of text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Accumulated text of one in-flight assistant message.
///
/// Feed fragments with [`push()`](Self::push) and close with either
/// [`finish()`](Self::finish) or [`fail()`](Self::fail). Once closed,
/// further fragments are ignored.
#[derive(Debug, Default)]
pub struct StreamingTextAccumulator {
    text: String,
    complete: bool,
    error: Option<String>,
}

impl StreamingTextAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the full snapshot.
    pub fn push(&mut self, fragment: &str) -> &str {
        if !self.complete {
            self.text.push_str(fragment);
        }
        &self.text
    }

    /// Mark the stream finished successfully.
    pub fn finish(&mut self) {
        self.complete = true;
    }

    /// Mark the stream failed, keeping the partial text.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.complete = true;
        self.error = Some(error.into());
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// What happened on a response turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEventKind {
    /// Next streamed fragment.
    Fragment(String),
    /// Single-shot grounded answer.
    Grounded {
        text: String,
        sources: Vec<GroundingSource>,
    },
    /// Stream ended normally.
    Finished,
    /// Request or stream failed.
    Failed(String),
}

/// A turn event tagged with the turn that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnEvent {
    pub turn: u64,
    pub kind: TurnEventKind,
}

impl TurnEvent {
    pub fn new(turn: u64, kind: TurnEventKind) -> Self {
        Self { turn, kind }
    }

    /// Whether this is the last event of its turn.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, TurnEventKind::Fragment(_))
    }
}

/// Drain `stream` into `tx` until it ends, fails, or `cancel` fires.
///
/// Exactly one terminal event is sent unless the turn is cancelled or the
/// receiver has gone away.
pub async fn pump_fragments(
    turn: u64,
    mut stream: FragmentStream,
    tx: mpsc::Sender<TurnEvent>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(turn, "fragment pump cancelled");
                return;
            }
            next = stream.next() => next,
        };

        let kind = match next {
            Some(Ok(fragment)) if fragment.is_empty() => continue,
            Some(Ok(fragment)) => TurnEventKind::Fragment(fragment),
            Some(Err(e)) => TurnEventKind::Failed(e.to_string()),
            None => TurnEventKind::Finished,
        };
        let event = TurnEvent::new(turn, kind);
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() {
            debug!(turn, "turn receiver dropped");
            return;
        }
        if terminal {
            return;
        }
    }
}
