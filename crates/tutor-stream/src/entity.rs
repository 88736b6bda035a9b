//! Units of generated tutoring content and their merge rules.

use std::fmt::{Debug, Display};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::EventTag;

/// How two copies of the same entity are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    /// Take each incoming field only when it carries more content.
    Richer,
    /// Keep every populated field; only fill blanks from the other copy.
    FillBlanks,
}

/// A keyed unit of streamed content (a curriculum day, an assignment variant).
pub trait Entity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Natural key used for de-duplication and ordering.
    type Key: Ord + Clone + Debug + Display + Send + Sync;

    /// Single-entity event tags; the first one is what producers emit.
    const ITEM_TAGS: &'static [EventTag];
    /// Full-collection event tags; the first one is what producers emit.
    const COLLECTION_TAGS: &'static [EventTag];

    fn key(&self) -> Self::Key;

    /// Combines `other` (same key) into `self`.
    fn merge(&mut self, other: Self, mode: MergeMode);

    /// Structural check used when a producer omits the `type` field.
    fn matches_shape(value: &Value) -> bool;

    /// Copy sent in incremental events; long prose may be shortened.
    fn summarized(&self, _max_chars: usize) -> Self {
        self.clone()
    }
}

/// One day of a generated curriculum.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CurriculumDay {
    pub day: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objectives: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activities: Vec<Value>,
    /// Producer fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CurriculumDay {
    pub fn new(day: u32, title: impl Into<String>) -> Self {
        Self {
            day,
            title: title.into(),
            ..Self::default()
        }
    }
}

impl Entity for CurriculumDay {
    type Key = u32;

    const ITEM_TAGS: &'static [EventTag] = &[EventTag::new("day", "day")];
    const COLLECTION_TAGS: &'static [EventTag] = &[EventTag::new("full_plan", "days")];

    fn key(&self) -> u32 {
        self.day
    }

    fn merge(&mut self, other: Self, mode: MergeMode) {
        merge_text(&mut self.title, other.title, mode);
        merge_text(&mut self.summary, other.summary, mode);
        merge_list(&mut self.objectives, other.objectives, mode);
        merge_list(&mut self.activities, other.activities, mode);
        merge_extra(&mut self.extra, other.extra);
    }

    fn matches_shape(value: &Value) -> bool {
        value.get("day").is_some_and(Value::is_u64)
    }

    fn summarized(&self, max_chars: usize) -> Self {
        Self {
            summary: truncate_chars(&self.summary, max_chars),
            ..self.clone()
        }
    }
}

/// One variant of a generated assignment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentVariant {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AssignmentVariant {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Self::default()
        }
    }
}

impl Entity for AssignmentVariant {
    type Key = String;

    const ITEM_TAGS: &'static [EventTag] = &[
        EventTag::new("variant", "variant"),
        EventTag::new("assignment", "assignment"),
    ];
    const COLLECTION_TAGS: &'static [EventTag] = &[EventTag::new("full_set", "variants")];

    fn key(&self) -> String {
        self.id.clone()
    }

    fn merge(&mut self, other: Self, mode: MergeMode) {
        merge_text(&mut self.title, other.title, mode);
        merge_text(&mut self.instructions, other.instructions, mode);
        merge_list(&mut self.questions, other.questions, mode);
        merge_extra(&mut self.extra, other.extra);
    }

    fn matches_shape(value: &Value) -> bool {
        value.get("id").is_some_and(Value::is_string)
            && (value.get("title").is_some() || value.get("instructions").is_some())
    }

    fn summarized(&self, max_chars: usize) -> Self {
        Self {
            instructions: truncate_chars(&self.instructions, max_chars),
            ..self.clone()
        }
    }
}

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn merge_text(current: &mut String, incoming: String, mode: MergeMode) {
    if is_blank(&incoming) {
        return;
    }
    let replace = match mode {
        MergeMode::FillBlanks => is_blank(current),
        MergeMode::Richer => incoming.chars().count() > current.chars().count(),
    };
    if replace {
        *current = incoming;
    }
}

fn merge_list<T>(current: &mut Vec<T>, incoming: Vec<T>, mode: MergeMode) {
    let replace = match mode {
        MergeMode::FillBlanks => current.is_empty(),
        MergeMode::Richer => incoming.len() > current.len(),
    };
    if replace && !incoming.is_empty() {
        *current = incoming;
    }
}

fn merge_extra(current: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        if value.is_null() {
            continue;
        }
        match current.get(&key) {
            Some(existing) if !existing.is_null() => {}
            _ => {
                current.insert(key, value);
            }
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", text[..cut].trim_end()),
        None => text.to_string(),
    }
}
