use std::marker::PhantomData;

use crate::classify::classify_candidate;
use crate::decoder::ChunkDecoder;
use crate::entity::Entity;
use crate::event::StreamEvent;
use crate::extractor::{Candidate, ExtractStrategy, Extractor};

/// Synchronous decode → extract → classify chain for one stream.
///
/// All work for a chunk happens inside `push_bytes`; the caller owns the
/// suspension points between chunks.
#[derive(Debug)]
pub struct EventPipeline<E> {
    decoder: ChunkDecoder,
    extractor: Extractor,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EventPipeline<E> {
    pub fn new(strategy: ExtractStrategy) -> Self {
        Self::from_extractor(Extractor::new(strategy))
    }

    pub fn with_max_buffer(strategy: ExtractStrategy, max_buffer_bytes: usize) -> Self {
        Self::from_extractor(Extractor::with_max_buffer(strategy, max_buffer_bytes))
    }

    fn from_extractor(extractor: Extractor) -> Self {
        Self {
            decoder: ChunkDecoder::new(),
            extractor,
            _entity: PhantomData,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Feeds one raw transport chunk.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<StreamEvent<E>> {
        let text = self.decoder.decode(chunk);
        self.push_text(&text)
    }

    /// Feeds already decoded text (model deltas arrive as strings).
    pub fn push_text(&mut self, text: &str) -> Vec<StreamEvent<E>> {
        classify_all(self.extractor.push(text))
    }

    /// Flushes decoder and extractor state at end of transport.
    pub fn finish(&mut self) -> Vec<StreamEvent<E>> {
        let tail = self.decoder.finish();
        let mut candidates = self.extractor.push(&tail);
        candidates.extend(self.extractor.finish());
        classify_all(candidates)
    }
}

fn classify_all<E: Entity>(candidates: Vec<Candidate>) -> Vec<StreamEvent<E>> {
    candidates.into_iter().filter_map(classify_candidate).collect()
}
