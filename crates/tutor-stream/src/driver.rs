use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::entity::Entity;
use crate::errors::StreamError;
use crate::event::StreamEvent;
use crate::extractor::{DEFAULT_MAX_BUFFER_BYTES, ExtractStrategy};
use crate::pipeline::EventPipeline;
use crate::reducer::{Reducer, Reduction};

/// Lifecycle callbacks for one stream.
///
/// `on_message` fires for every classified event up to and including the
/// first terminal one. `on_error` and `on_complete` are mutually exclusive and
/// each fires at most once. Nothing fires after cancellation.
pub trait StreamHandler<E> {
    fn on_message(&mut self, _event: &StreamEvent<E>) {}

    fn on_error(&mut self, _error: &StreamError) {}

    /// Receives a copy of the accumulated entities ordered by key.
    fn on_complete(&mut self, _entities: &[E]) {}
}

/// Handler that ignores every callback.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl<E> StreamHandler<E> for NoopHandler {}

/// Handle used to request cancellation of a running stream.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn aborted(&self) {
        let mut rx = self.subscribe();
        aborted(&mut rx).await;
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Driver lifecycle: `Idle → Streaming → {Completed | Errored | Cancelled}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

/// Drives one transport through the decode/extract/reduce pipeline.
///
/// A driver is single use. Retrying means building a new driver, which also
/// gives the retry a fresh buffer and accumulator.
pub struct StreamDriver<E: Entity> {
    stream_id: uuid::Uuid,
    strategy: ExtractStrategy,
    pipeline: EventPipeline<E>,
    reducer: Reducer<E>,
    state: DriverState,
    delivered: u64,
}

impl<E: Entity> StreamDriver<E> {
    pub fn new(strategy: ExtractStrategy) -> Self {
        Self::with_max_buffer(strategy, DEFAULT_MAX_BUFFER_BYTES)
    }

    pub fn with_max_buffer(strategy: ExtractStrategy, max_buffer_bytes: usize) -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4(),
            strategy,
            pipeline: EventPipeline::with_max_buffer(strategy, max_buffer_bytes),
            reducer: Reducer::new(),
            state: DriverState::Idle,
            delivered: 0,
        }
    }

    pub fn stream_id(&self) -> uuid::Uuid {
        self.stream_id
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Number of events handed to `on_message` so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Reads `transport` to completion, cancellation, or failure.
    ///
    /// Resolves with the accumulated entities on success. A cancelled stream
    /// resolves with `StreamError::Cancelled` and its partial state is
    /// discarded.
    pub async fn drive<S, H>(
        &mut self,
        transport: S,
        handler: &mut H,
        abort: &AbortHandle,
    ) -> Result<Vec<E>, StreamError>
    where
        S: Stream<Item = Result<Bytes, StreamError>>,
        H: StreamHandler<E> + ?Sized,
    {
        if self.state != DriverState::Idle {
            return Err(StreamError::Validation(format!(
                "stream driver already used (state={:?})",
                self.state
            )));
        }
        self.state = DriverState::Streaming;
        info!(
            event = "stream.started",
            domain = "stream",
            stream_id = %self.stream_id,
            strategy = ?self.strategy,
            "stream started"
        );

        let mut transport = std::pin::pin!(transport);
        let mut abort_rx = abort.subscribe();
        loop {
            if *abort_rx.borrow() {
                return Err(self.cancel());
            }
            let next = tokio::select! {
                biased;
                _ = aborted(&mut abort_rx) => return Err(self.cancel()),
                next = transport.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    debug!(
                        event = "stream.chunk",
                        domain = "stream",
                        stream_id = %self.stream_id,
                        bytes = chunk.len() as u64,
                        "transport chunk"
                    );
                    let events = self.pipeline.push_bytes(&chunk);
                    if let Some(result) = self.dispatch(events, handler, abort) {
                        return result;
                    }
                }
                Some(Err(err)) => return Err(self.fail(err, handler)),
                None => {
                    let events = self.pipeline.finish();
                    if let Some(result) = self.dispatch(events, handler, abort) {
                        return result;
                    }
                    debug!(
                        event = "stream.eof_without_terminal",
                        domain = "stream",
                        stream_id = %self.stream_id,
                        "transport ended before a terminal event"
                    );
                    return Ok(self.complete(handler));
                }
            }
        }
    }

    /// Runs the driver on a spawned task and returns a pull-style handle.
    pub fn spawn<S>(mut self, transport: S, abort: AbortHandle) -> StreamSubscription<E>
    where
        S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (final_tx, final_rx) = oneshot::channel();
        let stream_id = self.stream_id;
        let task_abort = abort.clone();
        tokio::spawn(async move {
            let mut handler = ChannelHandler { tx };
            let result = self.drive(transport, &mut handler, &task_abort).await;
            let _ = final_tx.send(result);
        });
        StreamSubscription {
            stream_id,
            rx,
            final_rx,
            abort,
        }
    }

    fn dispatch<H>(
        &mut self,
        events: Vec<StreamEvent<E>>,
        handler: &mut H,
        abort: &AbortHandle,
    ) -> Option<Result<Vec<E>, StreamError>>
    where
        H: StreamHandler<E> + ?Sized,
    {
        for event in events {
            // A callback may abort while a chunk still holds more events.
            if abort.is_aborted() {
                return Some(Err(self.cancel()));
            }
            handler.on_message(&event);
            self.delivered += 1;
            match self.reducer.apply(event) {
                Reduction::Continue | Reduction::Ignored => {}
                Reduction::Completed => return Some(Ok(self.complete(handler))),
                Reduction::Failed(message) => {
                    return Some(Err(self.fail(StreamError::remote(message), handler)));
                }
            }
        }
        None
    }

    fn complete<H>(&mut self, handler: &mut H) -> Vec<E>
    where
        H: StreamHandler<E> + ?Sized,
    {
        self.state = DriverState::Completed;
        let entities = self.reducer.accumulator().entities();
        info!(
            event = "stream.completed",
            domain = "stream",
            stream_id = %self.stream_id,
            entities = entities.len() as u64,
            finalized = self.reducer.accumulator().is_finalized(),
            total_generated = ?self.reducer.total_generated(),
            delivered = self.delivered,
            "stream completed"
        );
        handler.on_complete(&entities);
        entities
    }

    fn fail<H>(&mut self, error: StreamError, handler: &mut H) -> StreamError
    where
        H: StreamHandler<E> + ?Sized,
    {
        self.state = DriverState::Errored;
        warn!(
            event = "stream.failed",
            domain = "stream",
            stream_id = %self.stream_id,
            code = error.code(),
            error = %error,
            delivered = self.delivered,
            "stream failed"
        );
        handler.on_error(&error);
        error
    }

    fn cancel(&mut self) -> StreamError {
        self.state = DriverState::Cancelled;
        self.reducer = Reducer::new();
        info!(
            event = "stream.cancelled",
            domain = "stream",
            stream_id = %self.stream_id,
            delivered = self.delivered,
            "stream cancelled"
        );
        StreamError::Cancelled
    }
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

struct ChannelHandler<E> {
    tx: mpsc::UnboundedSender<StreamEvent<E>>,
}

impl<E: Clone> StreamHandler<E> for ChannelHandler<E> {
    fn on_message(&mut self, event: &StreamEvent<E>) {
        let _ = self.tx.send(event.clone());
    }
}

/// Pull-style handle returned by [`StreamDriver::spawn`].
pub struct StreamSubscription<E> {
    stream_id: uuid::Uuid,
    rx: mpsc::UnboundedReceiver<StreamEvent<E>>,
    final_rx: oneshot::Receiver<Result<Vec<E>, StreamError>>,
    abort: AbortHandle,
}

impl<E> StreamSubscription<E> {
    pub fn stream_id(&self) -> uuid::Uuid {
        self.stream_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Next classified event; `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent<E>> {
        self.rx.recv().await
    }

    /// Drains remaining events and returns the final result.
    pub async fn finish(mut self) -> Result<Vec<E>, StreamError> {
        while self.rx.recv().await.is_some() {}
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(StreamError::transport(format!(
                "stream task {} ended without a result",
                self.stream_id
            ))),
        }
    }
}
