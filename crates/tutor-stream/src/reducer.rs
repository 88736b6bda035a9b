//! Folds classified events into a key-ordered, de-duplicated accumulator.

use std::collections::BTreeMap;

use tracing::debug;

use crate::entity::{Entity, MergeMode};
use crate::event::StreamEvent;

/// Ordered, key-deduplicated entities of one stream.
#[derive(Clone, Debug)]
pub struct Accumulator<E: Entity> {
    entries: BTreeMap<E::Key, E>,
    finalized: bool,
}

impl<E: Entity> Default for Accumulator<E> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            finalized: false,
        }
    }
}

impl<E: Entity> Accumulator<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new key or merges a richer copy into the stored entity.
    ///
    /// Once a complete collection has been absorbed, partial copies only fill
    /// blank fields of known keys and unknown keys are ignored.
    ///
    /// Returns true when the key had not been seen before.
    pub fn upsert(&mut self, item: E) -> bool {
        let mode = if self.finalized {
            MergeMode::FillBlanks
        } else {
            MergeMode::Richer
        };
        match self.entries.get_mut(&item.key()) {
            Some(stored) => {
                stored.merge(item, mode);
                false
            }
            None if self.finalized => {
                debug!(
                    event = "stream.item_after_collection",
                    domain = "stream",
                    key = %item.key(),
                    "ignoring new key after complete collection"
                );
                false
            }
            None => {
                self.entries.insert(item.key(), item);
                true
            }
        }
    }

    /// Unions a complete collection into the accumulator.
    ///
    /// The complete copy wins; a stored partial copy only back-fills blanks.
    pub fn absorb_full(&mut self, items: Vec<E>) {
        for mut full in items {
            let key = full.key();
            if let Some(partial) = self.entries.remove(&key) {
                full.merge(partial, MergeMode::FillBlanks);
            }
            self.entries.insert(key, full);
        }
        self.finalized = true;
    }

    pub fn contains(&self, key: &E::Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once a complete collection has been absorbed.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Copy of the entities ordered by key.
    pub fn entities(&self) -> Vec<E> {
        self.entries.values().cloned().collect()
    }

    pub fn into_entities(self) -> Vec<E> {
        self.entries.into_values().collect()
    }
}

/// What applying one event did to the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reduction {
    /// Non-terminal event absorbed.
    Continue,
    /// First terminal `done`.
    Completed,
    /// First terminal `error`.
    Failed(String),
    /// Arrived after a terminal event and was not applied.
    Ignored,
}

/// Applies the de-duplication and finalization rules for one stream.
#[derive(Clone, Debug)]
pub struct Reducer<E: Entity> {
    accumulator: Accumulator<E>,
    notified: bool,
    total_generated: Option<u64>,
}

impl<E: Entity> Default for Reducer<E> {
    fn default() -> Self {
        Self {
            accumulator: Accumulator::new(),
            notified: false,
            total_generated: None,
        }
    }
}

impl<E: Entity> Reducer<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent<E>) -> Reduction {
        if self.notified {
            debug!(
                event = "stream.event_after_terminal",
                domain = "stream",
                kind = event.kind(),
                "ignoring event after terminal"
            );
            return Reduction::Ignored;
        }
        match event {
            StreamEvent::Progress { .. } => Reduction::Continue,
            StreamEvent::Item { item, .. } => {
                let key = item.key();
                let inserted = self.accumulator.upsert(item);
                debug!(
                    event = "stream.item_reduced",
                    domain = "stream",
                    key = %key,
                    inserted,
                    "item applied"
                );
                Reduction::Continue
            }
            StreamEvent::Collection { items, .. } => {
                self.accumulator.absorb_full(items);
                Reduction::Continue
            }
            StreamEvent::Done { total_generated } => {
                self.notified = true;
                self.total_generated = total_generated;
                Reduction::Completed
            }
            StreamEvent::Error { error } => {
                self.notified = true;
                Reduction::Failed(error)
            }
        }
    }

    pub fn accumulator(&self) -> &Accumulator<E> {
        &self.accumulator
    }

    /// True once a terminal event has been applied.
    pub fn is_notified(&self) -> bool {
        self.notified
    }

    pub fn total_generated(&self) -> Option<u64> {
        self.total_generated
    }

    pub fn into_entities(self) -> Vec<E> {
        self.accumulator.into_entities()
    }
}
