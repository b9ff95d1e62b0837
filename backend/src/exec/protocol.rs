//! Line protocol spoken by the local harness on stdout

use serde::Deserialize;

use crate::invoke::sse::SseFrame;

/// One JSON line from the harness
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HarnessLine {
    Token { data: String },
    /// Return value of the entry point, sent after any tokens
    Result { data: String },
    Error { message: String },
    End,
}

impl HarnessLine {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    pub fn into_frame(self) -> SseFrame {
        match self {
            HarnessLine::Token { data } | HarnessLine::Result { data } => SseFrame::message(&data),
            HarnessLine::Error { message } => SseFrame::error(&message),
            HarnessLine::End => SseFrame::end(),
        }
    }
}
