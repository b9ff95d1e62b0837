//! Normalizing endpoint responses into the requested shape

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::BackendError;
use crate::invoke::sse::{FrameKind, SseDecoder, SseFrame};

pub type FrameStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;

pub enum InvokeResponse {
    Json(Value),
    Stream(FrameStream),
}

impl std::fmt::Debug for InvokeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvokeResponse::Json(v) => f.debug_tuple("Json").field(v).finish(),
            InvokeResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

/// A JSON body, or text wrapped as `{"response": text}`
pub fn body_value(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| json!({ "response": body }))
}

/// Text of a sync response
pub fn response_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("response") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// Frames of an upstream event stream. Always ends with one `end` frame;
/// read failures become an `error` frame.
pub fn frames_from_bytes<S, B, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = SseDecoder::new();
        let mut pending = Vec::new();
        let mut ended = false;

        'read: while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    pending.extend_from_slice(bytes.as_ref());
                    let valid = match std::str::from_utf8(&pending) {
                        Ok(text) => text.len(),
                        Err(e) => e.valid_up_to(),
                    };
                    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);
                    for event in decoder.push(&text) {
                        let frame = event.into_frame();
                        if frame.is_end() {
                            ended = true;
                            break 'read;
                        }
                        yield frame;
                    }
                }
                Err(e) => {
                    warn!("Event stream read failed: {}", e);
                    yield SseFrame::error(&format!("stream interrupted: {}", e));
                    break 'read;
                }
            }
        }
        if !ended {
            if let Some(event) = decoder.finish() {
                let frame = event.into_frame();
                if !frame.is_end() {
                    yield frame;
                }
            }
        }
        yield SseFrame::end();
    })
}

/// A sync result presented as a stream: one message frame, then `end`
pub fn single_frame_stream(value: &Value) -> FrameStream {
    let frames = vec![SseFrame::message(&response_text(value)), SseFrame::end()];
    Box::pin(futures::stream::iter(frames))
}

/// An error presented as a stream
pub fn error_stream(message: &str) -> FrameStream {
    let frames = vec![SseFrame::error(message), SseFrame::end()];
    Box::pin(futures::stream::iter(frames))
}

/// Drain a stream into `{"response": <concatenation>, "streamed": true}`.
///
/// An error frame discards whatever was collected.
pub async fn collect_stream(endpoint: &str, mut frames: FrameStream) -> Result<Value, BackendError> {
    let mut text = String::new();
    while let Some(frame) = frames.next().await {
        match frame.kind {
            FrameKind::Message => text.push_str(&frame.text()),
            FrameKind::Error => {
                return Err(BackendError::InvocationError {
                    endpoint: endpoint.to_string(),
                    status: 200,
                    body: frame.text(),
                })
            }
            FrameKind::End => break,
        }
    }
    Ok(json!({ "response": text, "streamed": true }))
}

/// Shape a response the way the caller asked for it
pub async fn normalize(
    endpoint: &str,
    response: InvokeResponse,
    want_stream: bool,
) -> Result<InvokeResponse, BackendError> {
    match (response, want_stream) {
        (InvokeResponse::Stream(frames), true) => Ok(InvokeResponse::Stream(frames)),
        (InvokeResponse::Json(value), false) => Ok(InvokeResponse::Json(value)),
        (InvokeResponse::Json(value), true) => Ok(InvokeResponse::Stream(single_frame_stream(&value))),
        (InvokeResponse::Stream(frames), false) => {
            Ok(InvokeResponse::Json(collect_stream(endpoint, frames).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> {
        futures::stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    async fn all(frames: FrameStream) -> Vec<SseFrame> {
        frames.collect().await
    }

    #[test]
    fn test_content_type_classification() {
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }

    #[tokio::test]
    async fn test_upstream_frames_end_once() {
        let frames = all(frames_from_bytes(chunks(&[
            "event: message\ndata: \"He\"\n\n",
            "event: message\ndata: \"llo\"\n\nevent: end\ndata: \"\"\n\n",
            "event: message\ndata: \"late\"\n\n",
        ])))
        .await;
        assert_eq!(
            frames,
            vec![SseFrame::message("He"), SseFrame::message("llo"), SseFrame::end()]
        );
    }

    #[tokio::test]
    async fn test_missing_end_is_added() {
        let frames = all(frames_from_bytes(chunks(&["data: \"a\"\n\n", "data: \"b\""]))).await;
        assert_eq!(
            frames,
            vec![SseFrame::message("a"), SseFrame::message("b"), SseFrame::end()]
        );
    }

    #[tokio::test]
    async fn test_read_error_becomes_error_frame() {
        let body = futures::stream::iter(vec![
            Ok::<_, String>("data: \"a\"\n\n".as_bytes()),
            Err("reset".to_string()),
        ]);
        let frames = all(frames_from_bytes(body)).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].kind, FrameKind::Error);
        assert!(frames[2].is_end());
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let text = "data: \"caf\u{e9}\"\n\n".as_bytes();
        let split = text.len() - 4;
        let body = futures::stream::iter(vec![
            Ok::<_, String>(text[..split].to_vec()),
            Ok(text[split..].to_vec()),
        ]);
        let frames = all(frames_from_bytes(body)).await;
        assert_eq!(frames[0].text(), "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_stream_wanted_from_sync_endpoint() {
        let response = normalize("e", InvokeResponse::Json(json!({"response": "hi"})), true)
            .await
            .unwrap();
        let InvokeResponse::Stream(frames) = response else {
            panic!("expected a stream");
        };
        assert_eq!(all(frames).await, vec![SseFrame::message("hi"), SseFrame::end()]);
    }

    #[tokio::test]
    async fn test_sync_wanted_from_stream_endpoint() {
        let frames = frames_from_bytes(chunks(&[
            "event: message\ndata: \"Hel\"\n\nevent: message\ndata: \"lo\"\n\nevent: end\ndata: \"\"\n\n",
        ]));
        let response = normalize("e", InvokeResponse::Stream(frames), false).await.unwrap();
        let InvokeResponse::Json(value) = response else {
            panic!("expected json");
        };
        assert_eq!(value, json!({"response": "Hello", "streamed": true}));
    }

    #[tokio::test]
    async fn test_sync_wrapping_drops_partial_output_on_error() {
        let frames = frames_from_bytes(chunks(&[
            "event: message\ndata: \"partial\"\n\nevent: error\ndata: \"boom\"\n\nevent: end\ndata: \"\"\n\n",
        ]));
        let err = collect_stream("https://x", frames).await.unwrap_err();
        match err {
            BackendError::InvocationError { body, .. } => {
                assert_eq!(body, "boom");
                assert!(!body.contains("partial"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_body_value() {
        assert_eq!(body_value("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(body_value("text"), json!({"response": "text"}));
        assert_eq!(response_text(&json!({"response": "r"})), "r");
    }
}
