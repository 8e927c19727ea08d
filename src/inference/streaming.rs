//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads the HTTP body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each event as JSON, and yields the text deltas.
//! Tool calls travel inside the text as markup, so only `content` matters.

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::ChatCompletionChunk;

// ─── SSE event parser ────────────────────────────────────────────────────────

/// Parse an SSE byte stream into text deltas.
///
/// Bytes are buffered until a full event (`\n\n`) is available, so events and
/// multi-byte UTF-8 characters split across network reads are reassembled
/// before decoding. Keep-alives and empty deltas are skipped; `[DONE]` ends
/// the stream. A read error from the body ends the stream with that error.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<String, InferenceError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<InferenceError>,
{
    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, mut done)| async move {
            loop {
                if done {
                    return None;
                }

                if let Some(event_end) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).into_owned();

                    match process_event(&event) {
                        Ok(EventOutcome::Text(text)) => {
                            return Some((Ok(text), (byte_stream, buffer, done)))
                        }
                        Ok(EventOutcome::Skip) => continue,
                        Ok(EventOutcome::Done) => {
                            done = true;
                            continue;
                        }
                        Err(e) => return Some((Err(e), (byte_stream, buffer, done))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        done = true;
                        return Some((Err(e.into()), (byte_stream, buffer, done)));
                    }
                    None => {
                        // Stream ended; a final event may lack the trailing blank line.
                        done = true;
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        return match process_event(&rest) {
                            Ok(EventOutcome::Text(text)) => {
                                Some((Ok(text), (byte_stream, buffer, done)))
                            }
                            Ok(_) => None,
                            Err(e) => Some((Err(e), (byte_stream, buffer, done))),
                        };
                    }
                }
            }
        },
    )
}

/// Position of the first `\n\n` event separator in the buffer.
fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

enum EventOutcome {
    Text(String),
    Skip,
    Done,
}

/// Process a single SSE event string (may contain multiple `data:` lines).
fn process_event(event: &str) -> Result<EventOutcome, InferenceError> {
    let mut data_content = String::new();

    for line in event.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        {
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(EventOutcome::Done);
            }
            data_content.push_str(data);
        }
    }

    if data_content.is_empty() {
        return Ok(EventOutcome::Skip);
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
        })?;

    let text = chunk
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
        .unwrap_or_default();

    if text.is_empty() {
        Ok(EventOutcome::Skip)
    } else {
        Ok(EventOutcome::Text(text))
    }
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Parse a non-streaming response body into the assistant text.
pub fn parse_non_streaming_response(body: &str) -> Result<String, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp.choices.first().ok_or(InferenceError::StreamError {
        reason: "empty choices array".into(),
    })?;

    Ok(choice.message.content.clone().unwrap_or_default())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
