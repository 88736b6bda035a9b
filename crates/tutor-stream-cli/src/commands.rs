use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, bail};
use bytes::Bytes;
use clap::{Args, ValueEnum};
use futures::{StreamExt as _, stream};
use tracing::info;
use tutor_stream::producer::open_ndjson_body;
use tutor_stream::vendors::openai::OpenAiDeltaSource;
use tutor_stream::{
    AbortHandle, ClientConfig, DEFAULT_MAX_BUFFER_BYTES, Entity, ExtractStrategy,
    GenerationRequest, ProducerOptions, RetryPolicy, StreamClient, StreamDriver, StreamError,
    StreamRequest, retry_async,
};

use crate::output::{PrintHandler, write_stdout};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum EntityKind {
    /// Curriculum days keyed by day number.
    Curriculum,
    /// Assignment variants keyed by id.
    Assignment,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StrategyArg {
    Lines,
    Braces,
}

impl From<StrategyArg> for ExtractStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Lines => ExtractStrategy::Lines,
            StrategyArg::Braces => ExtractStrategy::Braces,
        }
    }
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Captured stream body.
    pub file: PathBuf,
    #[arg(short, long, value_enum, default_value_t = EntityKind::Curriculum)]
    pub entity: EntityKind,
    #[arg(short, long, value_enum, default_value_t = StrategyArg::Lines)]
    pub strategy: StrategyArg,
    /// Bytes per transport chunk; small values exercise split characters.
    #[arg(short, long, default_value_t = 64)]
    pub chunk_size: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_BYTES)]
    pub max_buffer_bytes: usize,
}

#[derive(Args)]
pub struct FetchArgs {
    /// Request path, joined to `TUTOR_STREAM_BASE_URL` (or an absolute URL).
    pub path: String,
    /// JSON request body.
    #[arg(short, long, default_value = "{}")]
    pub body: String,
    #[arg(short, long, value_enum, default_value_t = EntityKind::Curriculum)]
    pub entity: EntityKind,
    /// Overrides `TUTOR_STREAM_BASE_URL`.
    #[arg(long)]
    pub base_url: Option<String>,
    /// Forces an extraction strategy instead of using the response content type.
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,
}

#[derive(Args)]
pub struct GenerateArgs {
    /// User prompt sent to the model.
    #[arg(short, long)]
    pub prompt: String,
    #[arg(long)]
    pub system: Option<String>,
    #[arg(short, long, default_value = "gpt-5-nano")]
    pub model: String,
    #[arg(short, long, value_enum, default_value_t = EntityKind::Curriculum)]
    pub entity: EntityKind,
    /// Truncate long prose in item events to this many characters.
    #[arg(long)]
    pub summary_chars: Option<usize>,
    /// Seconds of model silence before a keepalive comment line.
    #[arg(long)]
    pub keepalive_secs: Option<u64>,
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
}

/// Aborts `abort` on Ctrl-C.
fn abort_on_ctrl_c(abort: &AbortHandle) {
    let abort = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "cli.interrupted");
            abort.abort();
        }
    });
}

pub async fn replay<E: Entity>(args: ReplayArgs) -> anyhow::Result<()> {
    if args.chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }
    let body = Bytes::from(
        tokio::fs::read(&args.file)
            .await
            .with_context(|| format!("reading {}", args.file.display()))?,
    );
    let chunk_size = args.chunk_size;
    let chunks = (0..body.len())
        .step_by(chunk_size)
        .map(move |start| Ok::<_, StreamError>(body.slice(start..(start + chunk_size).min(body.len()))));

    let abort = AbortHandle::new();
    abort_on_ctrl_c(&abort);
    let mut driver = StreamDriver::<E>::with_max_buffer(args.strategy.into(), args.max_buffer_bytes);
    let mut handler = PrintHandler::default();
    let entities = driver
        .drive(stream::iter(chunks), &mut handler, &abort)
        .await?;
    info!(
        event = "cli.replay_finished",
        entities = entities.len() as u64,
        delivered = driver.delivered()
    );
    Ok(())
}

pub async fn fetch<E: Entity>(args: FetchArgs) -> anyhow::Result<()> {
    let body: serde_json::Value =
        serde_json::from_str(&args.body).context("--body must be valid JSON")?;
    let config = match args.base_url {
        Some(base_url) => ClientConfig::new(base_url),
        None => ClientConfig::from_env()?,
    };
    let client = StreamClient::new(config)?;
    let mut request = StreamRequest::new(args.path, body);
    if let Some(strategy) = args.strategy {
        request = request.strategy(strategy.into());
    }

    let abort = AbortHandle::new();
    abort_on_ctrl_c(&abort);
    let policy = RetryPolicy::backoff(args.retries, Duration::from_millis(args.backoff_ms));
    let mut handler = PrintHandler::default();
    let entities: Vec<E> = client
        .start_stream_with_retry(&request, &mut handler, &abort, &policy)
        .await?;
    info!(event = "cli.fetch_finished", entities = entities.len() as u64);
    Ok(())
}

pub async fn generate<E: Entity>(args: GenerateArgs) -> anyhow::Result<()> {
    let source = OpenAiDeltaSource::from_env()?;
    let mut request = GenerationRequest::new(args.model, args.prompt);
    if let Some(system) = args.system {
        request = request.system_prompt(system);
    }
    let mut options = ProducerOptions::default();
    if let Some(max_chars) = args.summary_chars {
        options = options.summary_chars(max_chars);
    }
    if let Some(secs) = args.keepalive_secs {
        options = options.keepalive_interval(Duration::from_secs(secs));
    }

    let abort = AbortHandle::new();
    abort_on_ctrl_c(&abort);
    let policy = RetryPolicy::backoff(args.retries, Duration::from_millis(500));
    let mut body = retry_async(&policy, Some(&abort), |_| {
        open_ndjson_body::<E>(&source, request.clone(), options.clone())
    })
    .await?;

    loop {
        let next = tokio::select! {
            biased;
            _ = abort.aborted() => bail!(StreamError::Cancelled),
            next = body.next() => next,
        };
        match next {
            Some(line) => write_stdout(&line),
            None => break,
        }
    }
    Ok(())
}
