//! Per-client request limiting behind a swappable counter store.
//!
//! Callers only see [`RateLimiter`]. The single-process store keeps its
//! windows in a concurrent map; a shared store only has to implement
//! [`CounterStore::increment`].

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::StreamError;

/// Outcome of one `check_and_consume` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one request for `key` and reports whether it is allowed.
    async fn check_and_consume(&self, key: &str) -> Result<RateDecision, StreamError>;
}

/// Atomic per-key counter with a fixed expiry window.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key`, opening a new window when the
    /// previous one expired. Returns the new count and the time left in the
    /// window.
    async fn increment(&self, key: &str, window: Duration) -> Result<(u32, Duration), StreamError>;
}

/// Fixed-window limiter: at most `max_requests` per key per `window`.
#[derive(Debug)]
pub struct FixedWindowLimiter<S> {
    store: S,
    max_requests: u32,
    window: Duration,
}

impl<S: CounterStore> FixedWindowLimiter<S> {
    pub fn new(store: S, max_requests: u32, window: Duration) -> Result<Self, StreamError> {
        if max_requests == 0 {
            return Err(StreamError::Config("max_requests must be positive".into()));
        }
        if window.is_zero() {
            return Err(StreamError::Config("rate limit window must be positive".into()));
        }
        Ok(Self {
            store,
            max_requests,
            window,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait::async_trait]
impl<S: CounterStore> RateLimiter for FixedWindowLimiter<S> {
    async fn check_and_consume(&self, key: &str) -> Result<RateDecision, StreamError> {
        let (count, reset_after) = self.store.increment(key, self.window).await?;
        let allowed = count <= self.max_requests;
        if !allowed {
            debug!(
                event = "rate_limit.rejected",
                domain = "rate_limit",
                key,
                count,
                reset_after_ms = reset_after.as_millis() as u64,
                "rate limit exceeded"
            );
        }
        Ok(RateDecision {
            allowed,
            remaining: self.max_requests.saturating_sub(count),
            reset_after,
        })
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
    length: Duration,
}

impl Window {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }
}

/// Single-process counter store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCounterStore {
    windows: Arc<DashMap<String, Window>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys, expired windows included.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drops every expired window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_windows(&self.windows, Instant::now())
    }

    /// Sweeps expired windows every `interval` until the last clone of the
    /// store is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let windows: Weak<DashMap<String, Window>> = Arc::downgrade(&self.windows);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(windows) = windows.upgrade() else {
                    debug!(event = "rate_limit.sweeper_stopped", domain = "rate_limit");
                    break;
                };
                let removed = sweep_windows(&windows, Instant::now());
                if removed > 0 {
                    debug!(
                        event = "rate_limit.swept",
                        domain = "rate_limit",
                        removed = removed as u64
                    );
                }
            }
        })
    }
}

fn sweep_windows(windows: &DashMap<String, Window>, now: Instant) -> usize {
    let before = windows.len();
    windows.retain(|_, window| !window.expired(now));
    before.saturating_sub(windows.len())
}

#[async_trait::async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<(u32, Duration), StreamError> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            started: now,
            length: window,
        });
        let state = entry.value_mut();
        if state.expired(now) {
            state.count = 0;
            state.started = now;
            state.length = window;
        }
        state.count = state.count.saturating_add(1);
        let reset_after = state.length.saturating_sub(now.duration_since(state.started));
        Ok((state.count, reset_after))
    }
}
