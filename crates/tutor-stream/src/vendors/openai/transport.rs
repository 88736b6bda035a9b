//! Responses API SSE frames mapped to text deltas.

use serde_json::Value;
use tracing::warn;

use crate::decoder::ChunkDecoder;
use crate::errors::StreamError;
use crate::extractor::{Candidate, ExtractStrategy, Extractor};

/// One Responses API event reduced to what a delta source cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ResponsesEvent {
    Delta(String),
    /// Terminal success; carries the full text when the response has one.
    Completed { output_text: Option<String> },
}

/// Incremental SSE reader for a Responses stream.
///
/// SSE framing (`event:` lines, `data:` prefixes, comments) is handled by the
/// line extractor; every remaining line is one JSON event.
#[derive(Debug)]
pub(crate) struct ResponsesDecoder {
    decoder: ChunkDecoder,
    extractor: Extractor,
}

impl Default for ResponsesDecoder {
    fn default() -> Self {
        Self {
            decoder: ChunkDecoder::new(),
            extractor: Extractor::new(ExtractStrategy::Lines),
        }
    }
}

impl ResponsesDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<ResponsesEvent>, StreamError> {
        let text = self.decoder.decode(chunk);
        let candidates = self.extractor.push(&text);
        map_candidates(candidates)
    }

    pub fn finish(&mut self) -> Result<Vec<ResponsesEvent>, StreamError> {
        let tail = self.decoder.finish();
        let mut candidates = self.extractor.push(&tail);
        candidates.extend(self.extractor.finish());
        map_candidates(candidates)
    }
}

fn map_candidates(candidates: Vec<Candidate>) -> Result<Vec<ResponsesEvent>, StreamError> {
    let mut events = Vec::new();
    for candidate in candidates {
        match candidate {
            Candidate::Json(data) => {
                let value: Value = serde_json::from_str(&data).map_err(|e| {
                    StreamError::transport(format!("invalid SSE JSON frame: {e}"))
                })?;
                events.extend(map_responses_json(&value)?);
            }
            Candidate::Overflow(preview) => {
                warn!(
                    event = "openai.frame_overflow",
                    domain = "vendor",
                    preview = %preview,
                    "dropping oversized SSE frame"
                );
            }
        }
    }
    Ok(events)
}

pub(crate) fn map_responses_json(value: &Value) -> Result<Option<ResponsesEvent>, StreamError> {
    let Some(event_type) = value.get("type").and_then(Value::as_str) else {
        return Ok(None);
    };
    match event_type {
        "response.output_text.delta" => Ok(value
            .get("delta")
            .and_then(Value::as_str)
            .map(|delta| ResponsesEvent::Delta(delta.to_string()))),
        "response.completed" => {
            let response = value.get("response").unwrap_or(value);
            Ok(Some(ResponsesEvent::Completed {
                output_text: extract_output_text(response),
            }))
        }
        "response.error" | "response.failed" | "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .or_else(|| value.get("response").and_then(|r| r.pointer("/error/message")))
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("OpenAI stream error");
            Err(StreamError::remote(message))
        }
        _ => Ok(None),
    }
}

fn extract_output_text(response: &Value) -> Option<String> {
    let parts: Vec<&str> = response
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter_map(|content| content.get("text").and_then(Value::as_str))
        .collect();
    if !parts.is_empty() {
        return Some(parts.concat());
    }
    response
        .get("output_text")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
