use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use tracing::{debug, warn};

use crate::entity::Entity;
use crate::errors::StreamError;
use crate::event::StreamEvent;

use super::NdjsonProducer;
use super::source::{DeltaSource, GenerationRequest};

const KEEPALIVE_LINE: &[u8] = b": keepalive\n";

/// Chunked HTTP body of NDJSON lines.
pub type BodyStream = Pin<Box<dyn Stream<Item = Bytes> + Send + 'static>>;

/// Knobs for [`ndjson_body`].
#[derive(Clone, Debug, Default)]
pub struct ProducerOptions {
    /// Emits a comment line after this much source idle time.
    pub keepalive_interval: Option<Duration>,
    /// Progress line sent before the first delta.
    pub start_message: Option<String>,
    /// Truncation applied to item events.
    pub summary_chars: Option<usize>,
}

impl ProducerOptions {
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn start_message(mut self, message: impl Into<String>) -> Self {
        self.start_message = Some(message.into());
        self
    }

    pub fn summary_chars(mut self, max_chars: usize) -> Self {
        self.summary_chars = Some(max_chars);
        self
    }
}

/// Streams `source` through `producer` as NDJSON lines.
///
/// The body always ends with exactly one terminal line: `done` when the source
/// ends, `error` when it fails.
pub fn ndjson_body<E, S>(
    source: S,
    mut producer: NdjsonProducer<E>,
    options: ProducerOptions,
) -> impl Stream<Item = Bytes> + Send + 'static
where
    E: Entity,
    S: Stream<Item = Result<String, StreamError>> + Send + 'static,
{
    if let Some(max_chars) = options.summary_chars {
        producer = producer.summarize(max_chars);
    }
    async_stream::stream! {
        if let Some(message) = options.start_message {
            if let Some(line) = encode(&StreamEvent::<E>::progress(message)) {
                yield line;
            }
        }

        let mut source = Box::pin(source);
        loop {
            let next = match options.keepalive_interval {
                Some(interval) => match tokio::time::timeout(interval, source.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(event = "producer.keepalive", domain = "producer");
                        yield Bytes::from_static(KEEPALIVE_LINE);
                        continue;
                    }
                },
                None => source.next().await,
            };
            let (events, last) = match next {
                Some(Ok(delta)) => (producer.push_delta(&delta), false),
                Some(Err(err)) => (producer.fail(&err), true),
                None => (producer.finish(), true),
            };
            for event in events {
                if let Some(line) = encode(&event) {
                    yield line;
                }
            }
            if last {
                break;
            }
        }
    }
}

/// Opens a generation on `source` and wraps it with [`ndjson_body`].
pub async fn open_ndjson_body<E: Entity>(
    source: &dyn DeltaSource,
    request: GenerationRequest,
    options: ProducerOptions,
) -> Result<BodyStream, StreamError> {
    debug!(
        event = "producer.opening",
        domain = "producer",
        source = source.name(),
        model = %request.model
    );
    let deltas = source.open(request).await?;
    Ok(Box::pin(ndjson_body(deltas, NdjsonProducer::<E>::new(), options)))
}

fn encode<E: Entity>(event: &StreamEvent<E>) -> Option<Bytes> {
    match event.encode_line() {
        Ok(line) => Some(line),
        Err(err) => {
            warn!(
                event = "producer.encode_failed",
                domain = "producer",
                kind = event.kind(),
                error = %err
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::CurriculumDay;
    use futures::stream;

    fn lines(chunks: Vec<Bytes>) -> Vec<String> {
        chunks
            .into_iter()
            .map(|chunk| String::from_utf8_lossy(&chunk).trim_end().to_string())
            .collect()
    }

    #[tokio::test]
    async fn body_has_start_items_collection_and_done() {
        let deltas = stream::iter(vec![
            Ok("{\"day\":1,\"title\":\"A\"}".to_string()),
            Ok("{\"day\":2,\"title\":\"B\"}".to_string()),
        ]);
        let body = ndjson_body(
            deltas,
            NdjsonProducer::<CurriculumDay>::new(),
            ProducerOptions::default().start_message("Planning"),
        );
        let out = lines(body.collect().await);
        assert_eq!(out.len(), 5);
        assert!(out[0].contains("\"progress\""));
        assert!(out[1].contains("\"type\":\"day\""));
        assert!(out[3].contains("\"full_plan\""));
        assert!(out[4].contains("\"done\"") && out[4].contains("\"totalGenerated\":2"));
    }

    #[tokio::test]
    async fn source_failure_ends_with_error_line_only() {
        let deltas = stream::iter(vec![
            Ok("{\"day\":1,\"title\":\"A\"}".to_string()),
            Err(StreamError::transport("upstream reset")),
            Ok("{\"day\":2}".to_string()),
        ]);
        let body = ndjson_body(deltas, NdjsonProducer::<CurriculumDay>::new(), ProducerOptions::default());
        let out = lines(body.collect().await);
        assert_eq!(out.len(), 2);
        assert!(out[1].contains("\"error\":\"upstream reset\""));
        assert!(!out.iter().any(|line| line.contains("\"done\"")));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_gets_keepalive_comments() {
        let deltas = stream::once(async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok("{\"day\":1}".to_string())
        });
        let body = ndjson_body(
            deltas,
            NdjsonProducer::<CurriculumDay>::new(),
            ProducerOptions::default().keepalive_interval(Duration::from_millis(100)),
        );
        let out = lines(body.collect().await);
        assert_eq!(&out[..2], [": keepalive", ": keepalive"]);
        assert!(out.last().is_some_and(|line| line.contains("\"done\"")));
    }
}
