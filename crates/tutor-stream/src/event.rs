use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::entity::Entity;
use crate::errors::StreamError;

pub(crate) const KIND_PROGRESS: &str = "progress";
pub(crate) const KIND_DONE: &str = "done";
pub(crate) const KIND_ERROR: &str = "error";

const FALLBACK_ITEM_TAG: EventTag = EventTag::new("item", "item");
const FALLBACK_COLLECTION_TAG: EventTag = EventTag::new("full_set", "items");

/// Wire `type` value paired with the field that carries its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventTag {
    pub kind: &'static str,
    pub field: &'static str,
}

impl EventTag {
    pub const fn new(kind: &'static str, field: &'static str) -> Self {
        Self { kind, field }
    }
}

/// Classified application-level event of one content stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent<E> {
    /// Free-form status text, also used for malformed or overflowed input.
    Progress { value: String },
    /// A single, possibly summarized, entity.
    Item { tag: EventTag, item: E },
    /// The complete collection, normally sent once at the end.
    Collection { tag: EventTag, items: Vec<E> },
    /// Terminal success marker.
    Done { total_generated: Option<u64> },
    /// Terminal failure marker.
    Error { error: String },
}

impl<E: Entity> StreamEvent<E> {
    pub fn progress(value: impl Into<String>) -> Self {
        Self::Progress {
            value: value.into(),
        }
    }

    /// Item event using the entity's canonical tag.
    pub fn item(item: E) -> Self {
        Self::Item {
            tag: E::ITEM_TAGS.first().copied().unwrap_or(FALLBACK_ITEM_TAG),
            item,
        }
    }

    /// Collection event using the entity's canonical tag.
    pub fn collection(items: Vec<E>) -> Self {
        Self::Collection {
            tag: E::COLLECTION_TAGS
                .first()
                .copied()
                .unwrap_or(FALLBACK_COLLECTION_TAG),
            items,
        }
    }

    pub fn done(total_generated: Option<u64>) -> Self {
        Self::Done { total_generated }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Wire `type` of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => KIND_PROGRESS,
            Self::Item { tag, .. } | Self::Collection { tag, .. } => tag.kind,
            Self::Done { .. } => KIND_DONE,
            Self::Error { .. } => KIND_ERROR,
        }
    }

    /// True for `done` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// JSON object as it travels on the wire.
    pub fn to_wire(&self) -> Result<Value, StreamError> {
        let mut object = Map::new();
        object.insert("type".into(), json!(self.kind()));
        match self {
            Self::Progress { value } => {
                object.insert("value".into(), json!(value));
            }
            Self::Item { tag, item } => {
                object.insert(tag.field.into(), serde_json::to_value(item)?);
            }
            Self::Collection { tag, items } => {
                object.insert(tag.field.into(), serde_json::to_value(items)?);
            }
            Self::Done { total_generated } => {
                if let Some(total) = total_generated {
                    object.insert("totalGenerated".into(), json!(total));
                }
            }
            Self::Error { error } => {
                object.insert("error".into(), json!(error));
            }
        }
        Ok(Value::Object(object))
    }

    /// One NDJSON line, newline included.
    pub fn encode_line(&self) -> Result<Bytes, StreamError> {
        let mut line = serde_json::to_vec(&self.to_wire()?)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}
