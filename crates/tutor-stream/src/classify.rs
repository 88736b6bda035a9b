//! Turns extracted candidates into typed [`StreamEvent`]s.
//!
//! Nothing here fails the stream: unparsable text is downgraded to a
//! `progress` event and values that do not fit the schema are dropped.

use serde_json::{Map, Value};
use tracing::debug;

use crate::entity::Entity;
use crate::event::{EventTag, KIND_DONE, KIND_ERROR, KIND_PROGRESS, StreamEvent};
use crate::extractor::Candidate;

const UNKNOWN_ERROR: &str = "unknown stream error";

/// Parses and classifies one candidate.
pub fn classify_candidate<E: Entity>(candidate: Candidate) -> Option<StreamEvent<E>> {
    match candidate {
        Candidate::Overflow(preview) => Some(StreamEvent::progress(preview)),
        Candidate::Json(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => classify_value(value),
            Err(err) => {
                debug!(
                    event = "stream.malformed_fragment",
                    domain = "stream",
                    len = text.len() as u64,
                    error = %err,
                    "downgrading malformed fragment to progress"
                );
                Some(StreamEvent::progress(text))
            }
        },
    }
}

/// Classifies an already parsed JSON value.
pub fn classify_value<E: Entity>(value: Value) -> Option<StreamEvent<E>> {
    match value {
        Value::Object(map) => {
            let kind = map.get("type").and_then(Value::as_str).map(str::to_owned);
            match kind {
                Some(kind) => classify_tagged(&kind, map),
                None => classify_untagged(map),
            }
        }
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(E::matches_shape) {
                Some(StreamEvent::collection(deserialize_items(items)))
            } else {
                dropped("untagged array", None)
            }
        }
        Value::String(text) if !text.trim().is_empty() => Some(StreamEvent::progress(text)),
        _ => dropped("scalar value", None),
    }
}

fn classify_tagged<E: Entity>(kind: &str, mut map: Map<String, Value>) -> Option<StreamEvent<E>> {
    match kind {
        KIND_PROGRESS => match text_field(&map, &["value", "message"]) {
            Some(value) => Some(StreamEvent::progress(value)),
            None => dropped("progress without text", Some(kind)),
        },
        KIND_DONE => {
            let total = map
                .get("totalGenerated")
                .or_else(|| map.get("total_generated"))
                .and_then(Value::as_u64);
            Some(StreamEvent::done(total))
        }
        KIND_ERROR => Some(StreamEvent::error(error_message(&map))),
        _ => {
            if let Some(tag) = find_tag(E::ITEM_TAGS, kind) {
                return classify_item(tag, map);
            }
            if let Some(tag) = find_tag(E::COLLECTION_TAGS, kind) {
                return match map.remove(tag.field) {
                    Some(Value::Array(items)) => Some(StreamEvent::Collection {
                        tag,
                        items: deserialize_items(items),
                    }),
                    _ => dropped("collection without array", Some(kind)),
                };
            }
            dropped("unrecognized type", Some(kind))
        }
    }
}

fn classify_item<E: Entity>(tag: EventTag, mut map: Map<String, Value>) -> Option<StreamEvent<E>> {
    // Nested payload first: {"type":"day","day":{...}}; otherwise the entity
    // may be inlined next to the tag: {"type":"day","day":1,"title":...}.
    let nested = matches!(map.get(tag.field), Some(Value::Object(_)));
    let payload = if nested {
        map.remove(tag.field)
    } else {
        map.remove("type");
        Some(Value::Object(map))
    };
    match payload.map(serde_json::from_value::<E>) {
        Some(Ok(item)) => Some(StreamEvent::Item { tag, item }),
        Some(Err(err)) => {
            debug!(
                event = "stream.event_dropped",
                domain = "stream",
                kind = tag.kind,
                error = %err,
                "entity payload failed schema"
            );
            None
        }
        None => dropped("item without payload", Some(tag.kind)),
    }
}

fn classify_untagged<E: Entity>(mut map: Map<String, Value>) -> Option<StreamEvent<E>> {
    for tag in E::COLLECTION_TAGS {
        if matches!(map.get(tag.field), Some(Value::Array(_))) {
            if let Some(Value::Array(items)) = map.remove(tag.field) {
                return Some(StreamEvent::Collection {
                    tag: *tag,
                    items: deserialize_items(items),
                });
            }
        }
    }
    let value = Value::Object(map);
    if E::matches_shape(&value) {
        return match serde_json::from_value::<E>(value) {
            Ok(item) => Some(StreamEvent::item(item)),
            Err(_) => dropped("untagged entity failed schema", None),
        };
    }
    if let Value::Object(map) = &value
        && map.get("error").is_some_and(Value::is_string)
    {
        return Some(StreamEvent::error(error_message(map)));
    }
    dropped("untagged object", None)
}

fn find_tag(tags: &[EventTag], kind: &str) -> Option<EventTag> {
    tags.iter().copied().find(|tag| tag.kind == kind)
}

fn deserialize_items<E: Entity>(items: Vec<Value>) -> Vec<E> {
    let total = items.len();
    let parsed: Vec<E> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if parsed.len() != total {
        debug!(
            event = "stream.collection_items_dropped",
            domain = "stream",
            dropped = (total - parsed.len()) as u64,
            "collection entries failed schema"
        );
    }
    parsed
}

fn text_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(|value| match value {
            Value::String(text) if !text.is_empty() => Some(text.clone()),
            Value::Null | Value::String(_) => None,
            other => Some(other.to_string()),
        })
}

fn error_message(map: &Map<String, Value>) -> String {
    match map.get("error") {
        Some(Value::String(message)) if !message.is_empty() => message.clone(),
        Some(Value::Object(inner)) => {
            text_field(inner, &["message"]).unwrap_or_else(|| UNKNOWN_ERROR.to_string())
        }
        _ => text_field(map, &["message"]).unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
    }
}

fn dropped<E>(reason: &'static str, kind: Option<&str>) -> Option<StreamEvent<E>> {
    debug!(
        event = "stream.event_dropped",
        domain = "stream",
        reason,
        kind = kind.unwrap_or("-"),
        "ignoring event"
    );
    None
}
