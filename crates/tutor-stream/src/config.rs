use std::str::FromStr;
use std::time::Duration;

use crate::errors::StreamError;
use crate::extractor::DEFAULT_MAX_BUFFER_BYTES;

pub const ENV_BASE_URL: &str = "TUTOR_STREAM_BASE_URL";
pub const ENV_API_TOKEN: &str = "TUTOR_STREAM_API_TOKEN";
pub const ENV_TIMEOUT_SECS: &str = "TUTOR_STREAM_TIMEOUT_SECS";
pub const ENV_MAX_BUFFER_BYTES: &str = "TUTOR_STREAM_MAX_BUFFER_BYTES";

/// Configuration for [`crate::client::StreamClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL the request paths are joined to.
    pub base_url: String,
    /// Optional bearer token sent with every request.
    pub api_token: Option<String>,
    /// Connect timeout. Streams themselves are never timed out by the client.
    pub connect_timeout: Duration,
    /// Upper bound for the extraction buffer of one stream.
    pub max_buffer_bytes: usize,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            connect_timeout: Duration::from_secs(30),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }

    /// Builds a config from `TUTOR_STREAM_*` variables.
    ///
    /// `TUTOR_STREAM_BASE_URL` is required; the rest fall back to defaults.
    pub fn from_env() -> Result<Self, StreamError> {
        let base_url = env_string(ENV_BASE_URL)
            .ok_or_else(|| StreamError::Config(format!("missing {ENV_BASE_URL}")))?;
        let mut config = Self::new(base_url);
        config.api_token = env_string(ENV_API_TOKEN);
        if let Some(secs) = env_parse::<u64>(ENV_TIMEOUT_SECS)? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse::<usize>(ENV_MAX_BUFFER_BYTES)? {
            config.max_buffer_bytes = bytes;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(StreamError::Config("base_url must not be empty".into()));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StreamError::Config(format!(
                "base_url must be an http(s) URL, got {base}"
            )));
        }
        if self.max_buffer_bytes == 0 {
            return Err(StreamError::Config("max_buffer_bytes must be positive".into()));
        }
        Ok(())
    }

    /// Joins a request path onto the base URL. Absolute URLs pass through.
    pub(crate) fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Reads a variable, treating blank values as unset.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Reads and parses a variable. Unset is `Ok(None)`; unparsable is an error.
pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, StreamError> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StreamError::Config(format!("invalid value for {key}: {raw}"))),
        None => Ok(None),
    }
}
