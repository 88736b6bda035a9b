use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures::{StreamExt as _, stream};
use tutor_stream::producer::{BodyStream, open_ndjson_body};
use tutor_stream::rate_limit::RateLimiter as _;
use tutor_stream::{
    AbortHandle, ClientConfig, CurriculumDay, DeltaSource, DeltaStream, FixedWindowLimiter,
    GenerationRequest, InMemoryCounterStore, ProducerOptions, RetryPolicy, StreamClient,
    StreamError, StreamEvent, StreamHandler, StreamRequest,
};

struct ScriptedSource {
    deltas: Vec<&'static str>,
}

#[async_trait::async_trait]
impl DeltaSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _request: GenerationRequest) -> Result<DeltaStream, StreamError> {
        let deltas: Vec<Result<String, StreamError>> =
            self.deltas.iter().map(|delta| Ok(delta.to_string())).collect();
        Ok(Box::pin(stream::iter(deltas)))
    }
}

#[derive(Clone)]
struct AppState {
    attempts: Arc<AtomicU32>,
    limiter: Arc<FixedWindowLimiter<InMemoryCounterStore>>,
    source: Arc<ScriptedSource>,
}

impl AppState {
    fn new() -> Self {
        Self {
            attempts: Arc::new(AtomicU32::new(0)),
            limiter: Arc::new(
                FixedWindowLimiter::new(InMemoryCounterStore::new(), 1, Duration::from_secs(60))
                    .expect("limiter"),
            ),
            source: Arc::new(ScriptedSource {
                deltas: vec![
                    "Sure! ```json\n{\"day\":2,\"title\":\"Fun",
                    "ctions\",\"summary\":\"Defining and calling functions\"}\n{\"day\":1,",
                    "\"title\":\"Variables\"}\n```",
                ],
            }),
        }
    }
}

const DAY_THEN_DONE: &[u8] = b"{\"type\":\"day\",\"day\":{\"day\":1,\"title\":\"A\"}}\n{\"type\":\"done\"}\n";

fn ndjson_response(body: BodyStream) -> Response {
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body.map(Ok::<_, Infallible>)),
    )
        .into_response()
}

fn static_ndjson(bytes: &'static [u8]) -> Response {
    ndjson_response(Box::pin(stream::iter(vec![Bytes::from_static(bytes)])))
}

async fn curriculum(State(state): State<AppState>) -> Response {
    let body = open_ndjson_body::<CurriculumDay>(
        state.source.as_ref(),
        GenerationRequest::new("test-model", "Plan two days of Python"),
        ProducerOptions::default()
            .start_message("Planning")
            .summary_chars(12),
    )
    .await;
    match body {
        Ok(body) => ndjson_response(body),
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn flaky(State(state): State<AppState>) -> Response {
    let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt < 3 {
        return (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response();
    }
    static_ndjson(DAY_THEN_DONE)
}

async fn unavailable(State(state): State<AppState>) -> Response {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    (StatusCode::SERVICE_UNAVAILABLE, "down").into_response()
}

async fn bad_request(State(state): State<AppState>) -> Response {
    state.attempts.fetch_add(1, Ordering::SeqCst);
    (StatusCode::BAD_REQUEST, "missing topic").into_response()
}

async fn limited(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let key = headers
        .get("x-client-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("anonymous");
    match state.limiter.check_and_consume(key).await {
        Ok(decision) if decision.allowed => static_ndjson(DAY_THEN_DONE),
        Ok(decision) => (
            StatusCode::TOO_MANY_REQUESTS,
            format!("retry after {}s", decision.reset_after.as_secs()),
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn stalled_error() -> Response {
    let body = stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"upstream "))])
        .chain(stream::pending());
    (StatusCode::SERVICE_UNAVAILABLE, Body::from_stream(body)).into_response()
}

async fn plain_text() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "Here you go: {\"day\":1,\"title\":\"A\"} and {\"type\":\"done\",\"totalGenerated\":1}",
    )
        .into_response()
}

async fn serve() -> (StreamClient, AppState) {
    let state = AppState::new();
    let app = Router::new()
        .route("/api/curriculum/stream", post(curriculum))
        .route("/flaky", post(flaky))
        .route("/unavailable", post(unavailable))
        .route("/bad", post(bad_request))
        .route("/limited", post(limited))
        .route("/plain", post(plain_text))
        .route("/stalled-error", post(stalled_error))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    let client = StreamClient::new(ClientConfig::new(format!("http://{addr}"))).expect("client");
    (client, state)
}

#[derive(Default)]
struct Recorder {
    messages: Vec<StreamEvent<CurriculumDay>>,
    errors: Vec<StreamError>,
    completions: usize,
}

impl StreamHandler<CurriculumDay> for Recorder {
    fn on_message(&mut self, event: &StreamEvent<CurriculumDay>) {
        self.messages.push(event.clone());
    }

    fn on_error(&mut self, error: &StreamError) {
        self.errors.push(error.clone());
    }

    fn on_complete(&mut self, _entities: &[CurriculumDay]) {
        self.completions += 1;
    }
}

fn request(path: &str) -> StreamRequest {
    StreamRequest::new(path, serde_json::json!({"topic": "python"}))
}

fn quick_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy::backoff(max_retries, Duration::from_millis(5))
}

#[tokio::test]
async fn produced_body_is_consumed_end_to_end() {
    let (client, _state) = serve().await;
    let mut recorder = Recorder::default();
    let days: Vec<CurriculumDay> = client
        .start_stream(
            &request("/api/curriculum/stream"),
            &mut recorder,
            &AbortHandle::new(),
        )
        .await
        .expect("stream completes");

    assert_eq!(days.iter().map(|d| d.day).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(days[1].summary, "Defining and calling functions");

    let kinds: Vec<&str> = recorder.messages.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["progress", "day", "day", "full_plan", "done"]);
    let summarized = recorder.messages.iter().find_map(|event| match event {
        StreamEvent::Item { item, .. } if item.day == 2 => Some(item.summary.clone()),
        _ => None,
    });
    assert_eq!(summarized.as_deref(), Some("Defining and…"));
    assert_eq!(recorder.messages.last(), Some(&StreamEvent::done(Some(2))));
    assert_eq!(recorder.completions, 1);
    assert!(recorder.errors.is_empty());
}

#[tokio::test]
async fn retry_recovers_from_transient_statuses_without_reporting_them() {
    let (client, state) = serve().await;
    let mut recorder = Recorder::default();
    let days = client
        .start_stream_with_retry(
            &request("/flaky"),
            &mut recorder,
            &AbortHandle::new(),
            &quick_retries(3),
        )
        .await
        .expect("third attempt succeeds");

    assert_eq!(days, vec![CurriculumDay::new(1, "A")]);
    assert_eq!(state.attempts.load(Ordering::SeqCst), 3);
    assert!(recorder.errors.is_empty());
    assert_eq!(recorder.completions, 1);
}

#[tokio::test]
async fn exhausted_retries_report_one_error() {
    let (client, state) = serve().await;
    let mut recorder = Recorder::default();
    let result: Result<Vec<CurriculumDay>, _> = client
        .start_stream_with_retry(
            &request("/unavailable"),
            &mut recorder,
            &AbortHandle::new(),
            &quick_retries(2),
        )
        .await;

    assert!(matches!(result, Err(StreamError::Status { status: 503, .. })));
    assert_eq!(state.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.errors.len(), 1);
    assert_eq!(recorder.completions, 0);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (client, state) = serve().await;
    let mut recorder = Recorder::default();
    let result: Result<Vec<CurriculumDay>, _> = client
        .start_stream_with_retry(
            &request("/bad"),
            &mut recorder,
            &AbortHandle::new(),
            &quick_retries(5),
        )
        .await;

    assert_eq!(
        result,
        Err(StreamError::status(400, "missing topic"))
    );
    assert_eq!(state.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.errors.len(), 1);
}

#[tokio::test]
async fn rate_limited_request_surfaces_429() {
    let (client, _state) = serve().await;
    let abort = AbortHandle::new();

    let mut first = Recorder::default();
    client
        .start_stream(&request("/limited"), &mut first, &abort)
        .await
        .expect("first request allowed");

    let mut second = Recorder::default();
    let result: Result<Vec<CurriculumDay>, _> = client
        .start_stream(&request("/limited"), &mut second, &abort)
        .await;
    assert!(matches!(result, Err(StreamError::Status { status: 429, .. })));
    assert_eq!(second.errors.len(), 1);
    assert!(second.messages.is_empty());
}

#[tokio::test]
async fn plain_text_response_uses_brace_extraction() {
    let (client, _state) = serve().await;
    let mut recorder = Recorder::default();
    let days = client
        .start_stream(&request("/plain"), &mut recorder, &AbortHandle::new())
        .await
        .expect("stream completes");

    assert_eq!(days, vec![CurriculumDay::new(1, "A")]);
    let kinds: Vec<&str> = recorder.messages.iter().map(StreamEvent::kind).collect();
    assert_eq!(kinds, vec!["day", "done"]);
}

#[tokio::test]
async fn aborted_handle_short_circuits_before_connecting() {
    let (client, state) = serve().await;
    let abort = AbortHandle::new();
    abort.abort();
    let mut recorder = Recorder::default();
    let result: Result<Vec<CurriculumDay>, _> = client
        .start_stream(&request("/unavailable"), &mut recorder, &abort)
        .await;

    assert_eq!(result, Err(StreamError::Cancelled));
    assert_eq!(state.attempts.load(Ordering::SeqCst), 0);
    assert!(recorder.errors.is_empty());
}

#[tokio::test]
async fn abort_interrupts_a_stalled_error_body() {
    let (client, _state) = serve().await;
    let abort = AbortHandle::new();
    let remote = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.abort();
    });

    let mut recorder = Recorder::default();
    let result: Result<Vec<CurriculumDay>, _> = tokio::time::timeout(
        Duration::from_secs(5),
        client.start_stream(&request("/stalled-error"), &mut recorder, &abort),
    )
    .await
    .expect("abort resolves the request");

    assert_eq!(result, Err(StreamError::Cancelled));
    assert!(recorder.errors.is_empty());
    assert!(recorder.messages.is_empty());
}
