//! Server-sent event framing shared by every streaming path
//!
//! All adapters normalize to OpenAI-style frames: `data: <json>\n\n`,
//! terminated by `data: [DONE]\n\n`.

use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};

use crate::error::LlmError;
use crate::types::StreamChunk;

/// Normalized byte stream returned by streaming calls
pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

/// Terminal marker of every normalized stream
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Frame an already-serialized payload
pub fn frame(payload: &str) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

pub fn json_frame(payload: &Value) -> Bytes {
    frame(&payload.to_string())
}

/// `chat.completion.chunk` frame for one text delta
///
/// A `done` chunk produces the final frame with `finish_reason: "stop"`.
pub fn delta_frame(id: &str, model: &str, chunk: &StreamChunk) -> Bytes {
    let delta = chunk
        .delta_text
        .as_ref()
        .map_or_else(|| json!({}), |text| json!({ "content": text }));

    json_frame(&json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": if chunk.done { Value::from("stop") } else { Value::Null },
        }],
    }))
}

/// In-band error frame for failures after the stream has started
pub fn error_frame(error: &LlmError) -> Bytes {
    json_frame(&json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
        }
    }))
}

/// Encode text chunks as a normalized SSE stream
///
/// The stream ends after the first `done` chunk or error. A source that ends
/// without `done` still gets a terminal marker.
pub fn encode_chunks<S>(model: String, chunks: S) -> SseStream
where
    S: Stream<Item = Result<StreamChunk, LlmError>> + Send + 'static,
{
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());

    let frames = futures_util::stream::unfold(Some(Box::pin(chunks)), move |state| {
        let id = id.clone();
        let model = model.clone();

        async move {
            let mut chunks = state?;

            match chunks.next().await {
                Some(Ok(chunk)) if chunk.done => {
                    let mut last = delta_frame(&id, &model, &chunk).to_vec();
                    last.extend_from_slice(DONE_FRAME.as_bytes());
                    Some((Ok(Bytes::from(last)), None))
                }
                Some(Ok(chunk)) => Some((Ok(delta_frame(&id, &model, &chunk)), Some(chunks))),
                Some(Err(error)) => Some((Err(error), None)),
                None => Some((Ok(Bytes::from_static(DONE_FRAME.as_bytes())), None)),
            }
        }
    });

    Box::pin(frames)
}

/// Decode a normalized SSE stream back into text chunks
///
/// Frames without a text delta are skipped. An in-band error frame becomes a
/// [`LlmError::Streaming`].
pub fn text_deltas<S>(frames: S) -> impl Stream<Item = Result<StreamChunk, LlmError>> + Send
where
    S: Stream<Item = Result<Bytes, LlmError>> + Send + 'static,
{
    frames.eventsource().filter_map(|event| async move {
        let event = match event {
            Ok(event) => event,
            Err(EventStreamError::Transport(error)) => return Some(Err(error)),
            Err(error) => {
                return Some(Err(LlmError::Streaming {
                    provider: "sse".to_owned(),
                    message: error.to_string(),
                }));
            }
        };

        let data = event.data.trim();
        if data.is_empty() {
            return None;
        }
        if data == "[DONE]" {
            return Some(Ok(StreamChunk::done()));
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, data = %data, "skipping unparseable SSE frame");
                return None;
            }
        };

        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned);
            return Some(Err(LlmError::Streaming {
                provider: "sse".to_owned(),
                message,
            }));
        }

        payload
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(|text| Ok(StreamChunk::delta(text)))
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    async fn collect(stream: SseStream) -> String {
        let frames: Vec<Result<Bytes, LlmError>> = stream.collect().await;
        frames
            .into_iter()
            .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn frames_are_data_lines() {
        assert_eq!(frame("{\"a\":1}"), Bytes::from("data: {\"a\":1}\n\n"));
    }

    #[tokio::test]
    async fn chunks_encode_to_terminated_stream() {
        let chunks = stream::iter(vec![
            Ok(StreamChunk::delta("Hel")),
            Ok(StreamChunk::delta("lo")),
            Ok(StreamChunk::done()),
            Ok(StreamChunk::delta("ignored")),
        ]);

        let body = collect(encode_chunks("gemini-2.0-flash".to_owned(), chunks)).await;

        assert!(body.ends_with(DONE_FRAME));
        assert_eq!(body.matches("data: ").count(), 4);
        assert!(body.contains("\"content\":\"Hel\""));
        assert!(body.contains("\"finish_reason\":\"stop\""));
        assert!(!body.contains("ignored"));
    }

    #[tokio::test]
    async fn source_without_done_is_still_terminated() {
        let body = collect(encode_chunks(
            "m".to_owned(),
            stream::iter(vec![Ok(StreamChunk::delta("x"))]),
        ))
        .await;
        assert!(body.ends_with(DONE_FRAME));
    }

    #[tokio::test]
    async fn encoded_stream_decodes_to_same_text() {
        let encoded = encode_chunks(
            "m".to_owned(),
            stream::iter(vec![
                Ok(StreamChunk::delta("a")),
                Ok(StreamChunk::delta("b")),
                Ok(StreamChunk::done()),
            ]),
        );

        let decoded: Vec<StreamChunk> = text_deltas(encoded).map(Result::unwrap).collect().await;

        assert_eq!(
            decoded,
            vec![StreamChunk::delta("a"), StreamChunk::delta("b"), StreamChunk::done()]
        );
    }

    #[tokio::test]
    async fn decoder_surfaces_error_frames_and_transport_errors() {
        let frames = stream::iter(vec![
            Ok(error_frame(&LlmError::Configuration("log in first".to_owned()))),
            Err(LlmError::Cancelled),
        ]);

        let decoded: Vec<Result<StreamChunk, LlmError>> = text_deltas(frames).collect().await;

        assert!(matches!(
            &decoded[0],
            Err(LlmError::Streaming { message, .. }) if message.contains("log in first")
        ));
        assert!(matches!(decoded[1], Err(LlmError::Cancelled)));
    }
}
