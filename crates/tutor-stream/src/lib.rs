//! Incremental NDJSON/SSE event streaming for generated tutoring content.
//!
//! A producer emits one JSON event per line (or free-form text containing JSON
//! objects); the consumer decodes UTF-8 across chunk boundaries, extracts
//! candidates, classifies them into typed [`StreamEvent`]s, and folds entities
//! into a key-ordered accumulator while reporting lifecycle callbacks.
//!
//! # Consuming a stream
//!
//! ```no_run
//! use tutor_stream::prelude::*;
//!
//! struct Print;
//!
//! impl StreamHandler<CurriculumDay> for Print {
//!     fn on_message(&mut self, event: &StreamEvent<CurriculumDay>) {
//!         println!("{}", event.kind());
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let client = StreamClient::new(ClientConfig::new("http://localhost:3000"))?;
//! let request = StreamRequest::new("/api/curriculum/stream", serde_json::json!({"topic": "algebra"}));
//! let days: Vec<CurriculumDay> = client
//!     .start_stream(&request, &mut Print, &AbortHandle::new())
//!     .await?;
//! println!("{} days", days.len());
//! # Ok(())
//! # }
//! ```

/// Streaming HTTP client with retry at the call boundary.
pub mod client;
/// Client configuration and env helpers.
pub mod config;
/// Incremental UTF-8 decoding of transport chunks.
pub mod decoder;
/// Stream driver, lifecycle callbacks, and cancellation.
pub mod driver;
/// Entity trait and the tutoring entities.
pub mod entity;
/// Public error type.
pub mod errors;
/// Wire events and their NDJSON encoding.
pub mod event;
/// Candidate extraction strategies.
pub mod extractor;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Model deltas to NDJSON response bodies.
pub mod producer;
/// Per-client rate limiting.
pub mod rate_limit;
/// De-duplicating accumulator.
pub mod reducer;
/// Retry policy and helper.
pub mod retry;
/// Hosted model integrations.
pub mod vendors;

mod classify;
mod pipeline;

pub use classify::{classify_candidate, classify_value};
pub use client::{StreamClient, StreamRequest};
pub use config::ClientConfig;
pub use decoder::ChunkDecoder;
pub use driver::{
    AbortHandle, DriverState, NoopHandler, StreamDriver, StreamHandler, StreamSubscription,
};
pub use entity::{AssignmentVariant, CurriculumDay, Entity, MergeMode};
pub use errors::StreamError;
pub use event::{EventTag, StreamEvent};
pub use extractor::{Candidate, DEFAULT_MAX_BUFFER_BYTES, ExtractStrategy, Extractor};
pub use observability::init_observability;
pub use pipeline::EventPipeline;
pub use producer::{
    DeltaSource, DeltaStream, GenerationRequest, NdjsonProducer, ProducerOptions, ndjson_body,
};
pub use rate_limit::{
    CounterStore, FixedWindowLimiter, InMemoryCounterStore, RateDecision, RateLimiter,
};
pub use reducer::{Accumulator, Reducer, Reduction};
pub use retry::{RetryPolicy, retry_async};
