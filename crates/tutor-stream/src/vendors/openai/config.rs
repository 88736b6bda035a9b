use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::env_string;
use crate::errors::StreamError;

pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Connection settings for the Responses API.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API key used for bearer auth.
    pub api_key: String,
    /// Base URL for the OpenAI-compatible endpoint.
    ///
    /// Useful for proxies or local test servers.
    pub base_url: String,
    pub connect_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Builds a config from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, StreamError> {
        let api_key = env_string(ENV_OPENAI_API_KEY).ok_or_else(|| {
            StreamError::Config(format!("missing {ENV_OPENAI_API_KEY} for OpenAI source"))
        })?;
        let mut config = Self::new(api_key);
        if let Some(base_url) = env_string(ENV_OPENAI_BASE_URL) {
            config.base_url = base_url;
        }
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn responses_url(&self) -> String {
        format!("{}/v1/responses", self.base_url.trim_end_matches('/'))
    }
}

/// Reasoning effort hint for models that support it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Per-request Responses API options.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiRequestOptions {
    /// Whether OpenAI keeps the response server-side. Defaults to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl OpenAiRequestOptions {
    pub fn store(mut self, store: bool) -> Self {
        self.store = Some(store);
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning_effort = Some(effort);
        self
    }
}
