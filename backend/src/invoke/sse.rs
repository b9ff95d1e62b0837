//! Server-sent event frames
//!
//! Every stream this backend emits is a sequence of `message` frames, at most
//! one `error` frame, and a final `end` frame. Payloads are JSON encoded.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Message,
    Error,
    End,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Message => "message",
            FrameKind::Error => "error",
            FrameKind::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SseFrame {
    pub kind: FrameKind,
    /// JSON encoded payload
    pub data: String,
}

impl SseFrame {
    pub fn message(text: &str) -> Self {
        Self {
            kind: FrameKind::Message,
            data: json_string(text),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: FrameKind::Error,
            data: json_string(message),
        }
    }

    pub fn end() -> Self {
        Self {
            kind: FrameKind::End,
            data: json_string(""),
        }
    }

    pub fn is_end(&self) -> bool {
        self.kind == FrameKind::End
    }

    /// Payload as text
    pub fn text(&self) -> String {
        payload_text(&self.data)
    }

    /// Wire form, `event: <kind>\ndata: <payload>\n\n`
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind.as_str(), self.data)
    }
}

fn json_string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Text carried by an upstream `data:` payload.
///
/// JSON strings are unwrapped, objects yield their `data`, `response` or
/// `text` member, anything else is passed through as-is.
pub fn payload_text(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => ["data", "response", "text"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| data.to_string()),
        _ => data.to_string(),
    }
}

/// An event as parsed off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: Option<String>,
    pub data: String,
}

impl RawEvent {
    /// Normalize into a frame; unnamed events count as messages
    pub fn into_frame(self) -> SseFrame {
        match self.event.as_deref() {
            Some("error") => SseFrame::error(&payload_text(&self.data)),
            Some("end") => SseFrame::end(),
            _ => SseFrame::message(&payload_text(&self.data)),
        }
    }
}

/// Incremental parser for an event stream arriving in arbitrary chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed
    pub fn push(&mut self, chunk: &str) -> Vec<RawEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left open when the stream closed
    pub fn finish(&mut self) -> Option<RawEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            self.line(rest.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<RawEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        Some(RawEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
