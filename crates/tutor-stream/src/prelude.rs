//! Common imports for consuming and producing tutoring streams.
pub use crate::{
    AbortHandle, AssignmentVariant, ClientConfig, CurriculumDay, Entity, ExtractStrategy,
    NdjsonProducer, ProducerOptions, RetryPolicy, StreamClient, StreamError, StreamEvent,
    StreamHandler, StreamRequest,
};
