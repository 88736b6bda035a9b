//! Server side of the wire format: turns model text deltas into NDJSON events.

mod body;
mod source;

pub use body::{BodyStream, ProducerOptions, ndjson_body, open_ndjson_body};
pub use source::{DeltaSource, DeltaStream, GenerationRequest};

use serde_json::Value;
use tracing::{debug, info};

use crate::classify::classify_value;
use crate::entity::Entity;
use crate::errors::StreamError;
use crate::event::StreamEvent;
use crate::extractor::{Candidate, ExtractStrategy, Extractor};
use crate::reducer::Accumulator;

/// Incremental producer for one generation.
///
/// Entities are cut out of free-form model text with brace balancing, so
/// prose or code fences around them are tolerated. Each key is announced once
/// as an item event; the complete set follows at the end.
#[derive(Debug)]
pub struct NdjsonProducer<E: Entity> {
    extractor: Extractor,
    entities: Accumulator<E>,
    summary_chars: Option<usize>,
    finished: bool,
}

impl<E: Entity> Default for NdjsonProducer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> NdjsonProducer<E> {
    pub fn new() -> Self {
        Self {
            extractor: Extractor::new(ExtractStrategy::Braces),
            entities: Accumulator::new(),
            summary_chars: None,
            finished: false,
        }
    }

    /// Shortens long prose in item events to `max_chars`. The closing
    /// collection always carries the full entities.
    pub fn summarize(mut self, max_chars: usize) -> Self {
        self.summary_chars = Some(max_chars);
        self
    }

    pub fn max_buffer(mut self, max_buffer_bytes: usize) -> Self {
        self.extractor = Extractor::with_max_buffer(ExtractStrategy::Braces, max_buffer_bytes);
        self
    }

    /// Entities generated so far.
    pub fn total_generated(&self) -> usize {
        self.entities.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consumes one model delta and returns the item events it completed.
    pub fn push_delta(&mut self, delta: &str) -> Vec<StreamEvent<E>> {
        if self.finished {
            return Vec::new();
        }
        let candidates = self.extractor.push(delta);
        self.absorb(candidates)
    }

    /// Ends the generation: trailing items, the full collection, then `done`.
    pub fn finish(&mut self) -> Vec<StreamEvent<E>> {
        if self.finished {
            return Vec::new();
        }
        let candidates = self.extractor.finish();
        let mut events = self.absorb(candidates);
        self.finished = true;

        let total = self.entities.len();
        if total > 0 {
            events.push(StreamEvent::collection(self.entities.entities()));
        }
        events.push(StreamEvent::done(Some(total as u64)));
        info!(
            event = "producer.finished",
            domain = "producer",
            total_generated = total as u64
        );
        events
    }

    /// Ends the generation with an in-band error and no `done`.
    pub fn fail(&mut self, error: &StreamError) -> Vec<StreamEvent<E>> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        info!(
            event = "producer.failed",
            domain = "producer",
            code = error.code(),
            error = %error,
            generated = self.entities.len() as u64
        );
        vec![StreamEvent::error(error_message(error))]
    }

    fn absorb(&mut self, candidates: Vec<Candidate>) -> Vec<StreamEvent<E>> {
        let mut events = Vec::new();
        for candidate in candidates {
            let text = match candidate {
                Candidate::Json(text) => text,
                Candidate::Overflow(_) => {
                    debug!(
                        event = "producer.overflow",
                        domain = "producer",
                        "model output outgrew the buffer"
                    );
                    continue;
                }
            };
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(err) => {
                    debug!(
                        event = "producer.fragment_skipped",
                        domain = "producer",
                        error = %err
                    );
                    continue;
                }
            };
            match classify_value::<E>(value) {
                Some(StreamEvent::Item { item, .. }) => {
                    if let Some(event) = self.record(item) {
                        events.push(event);
                    }
                }
                Some(StreamEvent::Collection { items, .. }) => {
                    events.extend(items.into_iter().filter_map(|item| self.record(item)));
                }
                _ => {}
            }
        }
        events
    }

    /// Stores an entity; returns an item event only for a key not seen before.
    fn record(&mut self, item: E) -> Option<StreamEvent<E>> {
        let outgoing = match self.summary_chars {
            Some(max_chars) => item.summarized(max_chars),
            None => item.clone(),
        };
        self.entities
            .upsert(item)
            .then(|| StreamEvent::item(outgoing))
    }
}

fn error_message(error: &StreamError) -> String {
    match error {
        StreamError::Remote { message } | StreamError::Transport { message } => message.clone(),
        other => other.to_string(),
    }
}
