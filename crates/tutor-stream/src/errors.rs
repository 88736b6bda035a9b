/// Errors surfaced by the stream pipeline, the HTTP client, and the producer.
///
/// Only the variants that end a stream live here. Malformed fragments,
/// schema-invalid events, and buffer overflows are absorbed by the pipeline
/// and never become a `StreamError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Network or body read failure.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// The server answered with a non-success HTTP status.
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// The producer ended the stream with an in-band `error` event.
    #[error("stream error: {message}")]
    Remote { message: String },
    /// The caller aborted the stream.
    #[error("stream cancelled")]
    Cancelled,
    /// Invalid client or provider configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input (empty path, zero-sized buffer, ...).
    #[error("validation error: {0}")]
    Validation(String),
    /// An outbound event could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl StreamError {
    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a status error from a non-success response.
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Creates an error carried by an in-band `error` event.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Returns true when a fresh attempt may succeed.
    ///
    /// Transport failures and throttling/server statuses are retryable;
    /// in-band errors, cancellation, and caller mistakes are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => {
                matches!(status, 408 | 425 | 429) || (500..600).contains(status)
            }
            Self::Remote { .. }
            | Self::Cancelled
            | Self::Config(_)
            | Self::Validation(_)
            | Self::Encode(_) => false,
        }
    }

    /// Short stable code used in structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Status { .. } => "status",
            Self::Remote { .. } => "remote",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Encode(_) => "encode",
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::status(status.as_u16(), value.to_string()),
            None => Self::transport(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(value: serde_json::Error) -> Self {
        Self::Encode(value.to_string())
    }
}
