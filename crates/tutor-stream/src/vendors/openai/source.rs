use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use serde_json::{Value, json};
use tracing::debug;

use crate::errors::StreamError;
use crate::producer::{DeltaSource, DeltaStream, GenerationRequest};

use super::config::{OpenAiConfig, OpenAiRequestOptions};
use super::transport::{ResponsesDecoder, ResponsesEvent};

const OPENAI_SOURCE: &str = "openai";

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Delta source backed by OpenAI's streaming Responses API.
pub struct OpenAiDeltaSource {
    client: reqwest::Client,
    config: OpenAiConfig,
    options: OpenAiRequestOptions,
}

impl OpenAiDeltaSource {
    pub fn new(config: OpenAiConfig) -> Result<Self, StreamError> {
        if config.api_key.trim().is_empty() {
            return Err(StreamError::Config(
                "OpenAI config api_key must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build OpenAI client: {e}")))?;
        Ok(Self {
            client,
            config,
            options: OpenAiRequestOptions::default(),
        })
    }

    /// Creates a source using `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(OpenAiConfig::from_env()?)
    }

    pub fn with_options(mut self, options: OpenAiRequestOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait::async_trait]
impl DeltaSource for OpenAiDeltaSource {
    fn name(&self) -> &str {
        OPENAI_SOURCE
    }

    async fn open(&self, request: GenerationRequest) -> Result<DeltaStream, StreamError> {
        let body = build_request_body(&request, &self.options);
        debug!(
            event = "openai.request",
            domain = "vendor",
            model = %request.model,
            "starting OpenAI responses stream"
        );

        let response = self
            .client
            .post(self.config.responses_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("OpenAI request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamError::status(status.as_u16(), body));
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(delta_stream(bytes_stream)))
    }
}

pub(crate) fn build_request_body(request: &GenerationRequest, options: &OpenAiRequestOptions) -> Value {
    let mut input = Vec::new();
    if let Some(system_prompt) = request
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        input.push(json!({ "role": "system", "content": system_prompt }));
    }
    input.push(json!({ "role": "user", "content": request.user_prompt }));

    let mut body = json!({
        "model": request.model,
        "input": input,
        "stream": true,
        "store": options.store.unwrap_or(false),
    });
    if let Some(effort) = options.reasoning_effort {
        body["reasoning"] = json!({ "effort": effort });
    }
    body
}

/// Maps raw SSE bytes to text deltas, ending at `response.completed`.
///
/// When a response completes without having streamed any delta, its full
/// output text is emitted as one delta.
fn delta_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<String, StreamError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: ResponsesDecoder,
        pending: VecDeque<String>,
        saw_delta: bool,
        done: bool,
    }

    impl State {
        fn absorb(&mut self, events: Vec<ResponsesEvent>) {
            for event in events {
                if self.done {
                    return;
                }
                match event {
                    ResponsesEvent::Delta(delta) => {
                        self.saw_delta = true;
                        self.pending.push_back(delta);
                    }
                    ResponsesEvent::Completed { output_text } => {
                        if !self.saw_delta
                            && let Some(text) = output_text
                        {
                            self.pending.push_back(text);
                        }
                        self.done = true;
                    }
                }
            }
        }
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: ResponsesDecoder::default(),
            pending: VecDeque::new(),
            saw_delta: false,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(delta) = state.pending.pop_front() {
                    return Ok(Some((delta, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        let events = state.decoder.push_chunk(&chunk)?;
                        state.absorb(events);
                    }
                    Some(Err(e)) => {
                        return Err(StreamError::transport(format!(
                            "OpenAI streaming read failed: {e}"
                        )));
                    }
                    None => {
                        let events = state.decoder.finish()?;
                        state.absorb(events);
                        state.done = true;
                    }
                }
            }
        },
    )
}
