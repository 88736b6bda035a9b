use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::StreamError;

/// Text deltas from a hosted model, in arrival order.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send + 'static>>;

/// Prompt for one generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            user_prompt: user_prompt.into(),
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Anything that can stream model text for a prompt.
#[async_trait::async_trait]
pub trait DeltaSource: Send + Sync {
    /// Short provider name used in logs.
    fn name(&self) -> &str;

    /// Starts a generation. Failures before the first delta are returned here;
    /// later ones arrive as `Err` items on the stream.
    async fn open(&self, request: GenerationRequest) -> Result<DeltaStream, StreamError>;
}
