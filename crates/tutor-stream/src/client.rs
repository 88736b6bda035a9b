//! HTTP entry point: POSTs a JSON body and drives the streamed response.

use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::driver::{AbortHandle, StreamDriver, StreamHandler};
use crate::entity::Entity;
use crate::errors::StreamError;
use crate::event::StreamEvent;
use crate::extractor::ExtractStrategy;
use crate::retry::{RetryPolicy, backoff_or_abort};

/// One streaming request.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// Path joined to the configured base URL, or an absolute URL.
    pub path: String,
    pub body: Value,
    /// Forces an extraction strategy instead of sniffing `Content-Type`.
    pub strategy: Option<ExtractStrategy>,
}

impl StreamRequest {
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
            strategy: None,
        }
    }

    pub fn strategy(mut self, strategy: ExtractStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Client that opens streams and feeds them through a [`StreamDriver`].
#[derive(Clone, Debug)]
pub struct StreamClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Creates a client from `TUTOR_STREAM_*` variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens one stream and drives it to completion, failure, or cancellation.
    ///
    /// Pre-stream failures (connect errors, non-2xx statuses) are reported
    /// through `on_error` like any other stream failure.
    pub async fn start_stream<E, H>(
        &self,
        request: &StreamRequest,
        handler: &mut H,
        abort: &AbortHandle,
    ) -> Result<Vec<E>, StreamError>
    where
        E: Entity,
        H: StreamHandler<E> + ?Sized,
    {
        if request.path.trim().is_empty() {
            return Err(StreamError::Validation("request path must not be empty".into()));
        }
        if abort.is_aborted() {
            return Err(StreamError::Cancelled);
        }

        let url = self.config.url_for(&request.path);
        debug!(event = "stream.request", domain = "stream", url = %url, "opening stream");
        let mut http_req = self
            .http
            .post(&url)
            .header(ACCEPT, "application/x-ndjson, text/event-stream")
            .json(&request.body);
        if let Some(token) = self.config.api_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }

        let sent = tokio::select! {
            biased;
            _ = abort.aborted() => return Err(StreamError::Cancelled),
            sent = http_req.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let err = StreamError::transport(format!("stream request failed: {e}"));
                handler.on_error(&err);
                return Err(err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(StreamError::Cancelled),
                body = response.text() => body.unwrap_or_else(|_| "<unreadable body>".to_string()),
            };
            let err = StreamError::status(status.as_u16(), body);
            handler.on_error(&err);
            return Err(err);
        }

        let strategy = request.strategy.unwrap_or_else(|| {
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(ExtractStrategy::for_content_type)
                .unwrap_or_default()
        });
        let transport = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::transport(format!("stream read failed: {e}"))));

        let mut driver = StreamDriver::with_max_buffer(strategy, self.config.max_buffer_bytes);
        driver.drive(transport, handler, abort).await
    }

    /// Like [`start_stream`](Self::start_stream), retrying retryable failures
    /// that happen before the first event is delivered.
    ///
    /// `on_error` fires once, for the final failure only.
    pub async fn start_stream_with_retry<E, H>(
        &self,
        request: &StreamRequest,
        handler: &mut H,
        abort: &AbortHandle,
        policy: &RetryPolicy,
    ) -> Result<Vec<E>, StreamError>
    where
        E: Entity,
        H: StreamHandler<E> + ?Sized,
    {
        let mut retries_done = 0u32;
        loop {
            let mut attempt = AttemptHandler::new(&mut *handler);
            let result = self.start_stream(request, &mut attempt, abort).await;
            let (delivered, deferred) = attempt.into_parts();
            let err = match result {
                Ok(entities) => return Ok(entities),
                Err(err) => err,
            };

            if !delivered && err.is_retryable() && policy.allows_retry(retries_done) {
                let backoff = policy.delay_for(retries_done);
                info!(
                    event = "stream.retry_scheduled",
                    domain = "stream",
                    attempt = retries_done + 1,
                    next_attempt = retries_done + 2,
                    backoff_ms = backoff.as_millis() as u64,
                    code = err.code(),
                    error = %err
                );
                backoff_or_abort(backoff, Some(abort)).await?;
                retries_done += 1;
                continue;
            }

            if let Some(deferred) = deferred {
                handler.on_error(&deferred);
            }
            return Err(err);
        }
    }
}

/// Forwards callbacks for one attempt while holding back `on_error`, so a
/// retried failure is never reported to the caller.
struct AttemptHandler<'a, H: ?Sized> {
    inner: &'a mut H,
    delivered: bool,
    deferred: Option<StreamError>,
}

impl<'a, H: ?Sized> AttemptHandler<'a, H> {
    fn new(inner: &'a mut H) -> Self {
        Self {
            inner,
            delivered: false,
            deferred: None,
        }
    }

    fn into_parts(self) -> (bool, Option<StreamError>) {
        (self.delivered, self.deferred)
    }
}

impl<E, H> StreamHandler<E> for AttemptHandler<'_, H>
where
    H: StreamHandler<E> + ?Sized,
{
    fn on_message(&mut self, event: &StreamEvent<E>) {
        self.delivered = true;
        self.inner.on_message(event);
    }

    fn on_error(&mut self, error: &StreamError) {
        self.deferred = Some(error.clone());
    }

    fn on_complete(&mut self, entities: &[E]) {
        self.delivered = true;
        self.inner.on_complete(entities);
    }
}
