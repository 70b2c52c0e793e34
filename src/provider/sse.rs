//! Incremental Server-Sent Events decoding for `alt=sse` responses.
//!
//! Only the `data:` field carries payload in Generative Language streams;
//! `event:` and `id:` are kept for completeness. Bytes are buffered until a
//! full line is available so multi-byte characters split across network
//! chunks decode correctly.
//!
//! ```
//! use intelliagent::provider::sse::SseDecoder;
//!
//! let mut decoder = SseDecoder::new();
//! assert!(decoder.push(b"data: {\"a\":").is_empty());
//! let events = decoder.push(b"1}\n\n");
//! assert_eq!(events[0].data, "{\"a\":1}");
//! ```

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event_type: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// OpenAI-style terminator some proxies append.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
struct PendingEvent {
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl PendingEvent {
    fn take(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event_type = None;
            self.id = None;
            return None;
        }
        let event = SseEvent {
            event_type: self.event_type.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.take();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => self.data.push(value.to_owned()),
            "event" => self.event_type = Some(value.to_owned()),
            "id" => self.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }
}

/// Byte-level incremental decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: PendingEvent,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.pending.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Emit whatever is left when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_owned();
            if let Some(event) = self.pending.line(&line) {
                return Some(event);
            }
        }
        self.pending.take()
    }
}
