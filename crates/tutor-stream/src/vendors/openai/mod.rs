//! OpenAI Responses API as a delta source.
//!
//! Only `response.output_text.delta`, `response.completed`, and the failure
//! events are interpreted; everything else in the stream is skipped.
mod config;
mod source;
pub(crate) mod transport;

pub use config::{
    ENV_OPENAI_API_KEY, ENV_OPENAI_BASE_URL, OpenAiConfig, OpenAiRequestOptions, ReasoningEffort,
};
pub use source::OpenAiDeltaSource;
