//! The background worker that drives orders through the accrual system.
//!
//! A single tick loop owns the backlog outright; producers only ever push
//! order ids onto an `mpsc` queue, and a `CancellationToken` drives clean
//! shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use model::{AccrualResponse, OrderStatus};
use regex::Regex;
use repository::{RepositoryError, Store};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Errors surfaced while polling a single order, kept as distinct variants
/// rather than folded into one opaque error so callers can match on the
/// retry/terminal distinction directly.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("order not registered with the accrual system")]
    OrderNotFound,
    #[error("rate limited, retry after {retry_after:?}")]
    Throttled {
        retry_after: Option<Duration>,
        rate_per_minute: Option<u64>,
    },
    #[error("accrual system returned an unexpected status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("request to accrual system failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Store(#[from] RepositoryError),
}

/// Token-bucket limiter whose rate can be lowered at runtime in response
/// to a 429, then restored once the throttle window elapses.
///
/// `governor`'s `RateLimiter` bakes its `Quota` in at construction and has
/// no supported way to swap it later; since this needs to go from
/// unbounded to a server-dictated rate and back, the bucket is hand-rolled
/// instead of reaching for a crate that doesn't fit the shape.
struct BucketState {
    /// `None` means unbounded: every `acquire` returns immediately.
    rate_per_sec: Option<f64>,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn unbounded() -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate_per_sec: None,
                burst: 0.0,
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available, consuming it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let Some(rate) = state.rate_per_sec else {
                    return;
                };
                refill(&mut state, rate);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };
            sleep(wait).await;
        }
    }

    /// Applies a 429 response: drop to the dictated rate with zero burst,
    /// immediately.
    pub async fn throttle(&self, rate_per_minute: u64) {
        let mut state = self.state.lock().await;
        state.rate_per_sec = Some(rate_per_minute as f64 / 60.0);
        state.burst = 0.0;
        state.tokens = 0.0;
        state.last_refill = Instant::now();
    }

    /// Restores burst capacity once the throttle window has elapsed.
    pub async fn restore_burst(&self, rate_per_minute: u64) {
        let mut state = self.state.lock().await;
        let burst = (rate_per_minute as f64 / 60.0).floor();
        state.burst = burst;
        state.tokens = burst;
        state.last_refill = Instant::now();
    }
}

fn refill(state: &mut BucketState, rate: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
    // Even at burst 0 a single token must still be reachable, or a
    // throttled bucket can never refill on its own and `acquire` spins
    // forever; the cap is at least 1.0 regardless of configured burst.
    let cap = state.burst.max(1.0);
    state.tokens = (state.tokens + elapsed * rate).min(cap);
    state.last_refill = now;
}

/// Parses the "No more than N requests per minute allowed" body the
/// accrual system sends alongside a 429. A regex rather than a stricter
/// JSON schema, since the field is prose, not a structured error.
fn parse_rate_from_body(body: &str) -> Option<u64> {
    let re = Regex::new(r"No more than (\d+) requests per minute allowed").ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}

/// Polls one order against the accrual system and classifies the result.
async fn poll_one(
    client: &reqwest::Client,
    accrual_address: &str,
    order_id: i64,
) -> Result<Option<AccrualResponse>, PollError> {
    let url = format!("{}/api/orders/{}", accrual_address.trim_end_matches('/'), order_id);
    let resp = client.get(&url).header("Accept", "application/json").send().await?;

    match resp.status() {
        reqwest::StatusCode::OK => {
            let body: AccrualResponse = resp.json().await?;
            Ok(Some(body))
        }
        reqwest::StatusCode::NO_CONTENT => Err(PollError::OrderNotFound),
        reqwest::StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            let rate_per_minute = parse_rate_from_body(&body);
            Err(PollError::Throttled {
                retry_after,
                rate_per_minute,
            })
        }
        other => Err(PollError::UnexpectedStatus(other)),
    }
}

/// How many per-order polls a single tick runs concurrently. The rate
/// limiter is the real throttle; this just bounds the number of in-flight
/// HTTP requests and database writes at once.
const MAX_CONCURRENT_POLLS: usize = 10;

/// What to do with a backlog entry once its poll has resolved.
enum Outcome {
    /// Terminal: drop it from the backlog for good.
    Done,
    /// Needs another look next tick.
    Requeue,
    /// Needs another look, and the shared limiter must be throttled.
    Throttled {
        rate_per_minute: u64,
        downtime: Duration,
    },
}

/// Background worker. Owns a backlog of order ids awaiting a poll and an
/// `mpsc::Sender` handle callers use to push newly-registered orders onto
/// it.
pub struct Poller {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    accrual_address: String,
    poll_interval: Duration,
    limiter: Arc<RateLimiter>,
    concurrency: Arc<tokio::sync::Semaphore>,
    backlog_tx: mpsc::UnboundedSender<i64>,
    backlog_rx: Mutex<mpsc::UnboundedReceiver<i64>>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        store: Arc<dyn Store>,
        accrual_address: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        Self {
            store,
            client: reqwest::Client::new(),
            accrual_address: accrual_address.into(),
            poll_interval,
            limiter: Arc::new(RateLimiter::unbounded()),
            concurrency: Arc::new(tokio::sync::Semaphore::new(MAX_CONCURRENT_POLLS)),
            backlog_tx,
            backlog_rx: Mutex::new(backlog_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Handle callers use to enqueue a freshly-registered order for polling.
    pub fn enqueue_handle(&self) -> mpsc::UnboundedSender<i64> {
        self.backlog_tx.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the tick loop until cancelled. Intended to be spawned as its
    /// own task by the caller.
    pub async fn run(&self) {
        let mut backlog: VecDeque<i64> = VecDeque::new();
        let mut tick = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("poller shutting down");
                    return;
                }
                _ = tick.tick() => {
                    self.drain_incoming(&mut backlog);
                    self.poll_backlog(&mut backlog).await;
                }
            }
        }
    }

    fn drain_incoming(&self, backlog: &mut VecDeque<i64>) {
        let mut rx = self.backlog_rx.try_lock().expect("poller run loop owns the receiver");
        while let Ok(id) = rx.try_recv() {
            backlog.push_back(id);
        }
    }

    /// Snapshots the backlog and launches one bounded concurrent poll task
    /// per order; waits for the whole batch before the next tick. Orders
    /// that don't resolve to a terminal state — including every order a
    /// task hadn't gotten to yet when a 429 hit — are put back.
    async fn poll_backlog(&self, backlog: &mut VecDeque<i64>) {
        let pending: Vec<i64> = std::mem::take(backlog).into_iter().collect();
        let mut tasks = tokio::task::JoinSet::new();

        for order_id in pending {
            let store = Arc::clone(&self.store);
            let client = self.client.clone();
            let accrual_address = self.accrual_address.clone();
            let limiter = Arc::clone(&self.limiter);
            let concurrency = Arc::clone(&self.concurrency);
            tasks.spawn(async move {
                let _permit = concurrency.acquire_owned().await;
                limiter.acquire().await;
                let result = poll_one(&client, &accrual_address, order_id).await;
                let outcome = classify(&store, order_id, result).await;
                (order_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (order_id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "poll task panicked, re-enqueueing its order");
                    continue;
                }
            };
            match outcome {
                Outcome::Done => {}
                Outcome::Requeue => backlog.push_back(order_id),
                Outcome::Throttled {
                    rate_per_minute,
                    downtime,
                } => {
                    backlog.push_back(order_id);
                    self.limiter.throttle(rate_per_minute).await;
                    self.schedule_burst_restore(rate_per_minute, downtime);
                }
            }
        }
    }

    fn schedule_burst_restore(&self, rate_per_minute: u64, downtime: Duration) {
        let limiter = Arc::clone(&self.limiter);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(downtime) => {
                    limiter.restore_burst(rate_per_minute).await;
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
}

/// Applies a single order's poll result and decides what the backlog
/// should do with it next.
async fn classify(
    store: &Arc<dyn Store>,
    order_id: i64,
    result: Result<Option<AccrualResponse>, PollError>,
) -> Outcome {
    match result {
        Ok(Some(accrual)) => match store.update_order_info(&accrual).await {
            Ok(_) if matches!(accrual.status, OrderStatus::Processed | OrderStatus::Invalid) => {
                Outcome::Done
            }
            Ok(_) => Outcome::Requeue,
            Err(e) => {
                tracing::error!(order_id, error = %e, "failed to apply accrual update");
                Outcome::Requeue
            }
        },
        Ok(None) | Err(PollError::OrderNotFound) => {
            // Not yet known to the accrual system; try again next tick.
            Outcome::Requeue
        }
        Err(PollError::Throttled {
            rate_per_minute: None,
            ..
        }) => {
            // 429 without a parseable rate sentence: back off by
            // re-enqueueing, but leave the shared limiter alone.
            Outcome::Requeue
        }
        Err(PollError::Throttled {
            retry_after,
            rate_per_minute: Some(rate_per_minute),
        }) => Outcome::Throttled {
            rate_per_minute,
            downtime: retry_after.unwrap_or(Duration::from_secs(60)),
        },
        Err(e) => {
            tracing::warn!(order_id, error = %e, "poll failed, will retry next tick");
            Outcome::Requeue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_rate_from_body() {
        let body = "No more than 100 requests per minute allowed.";
        assert_eq!(parse_rate_from_body(body), Some(100));
    }

    #[test]
    fn unparseable_body_yields_no_rate() {
        assert_eq!(parse_rate_from_body("internal error"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_then_restore_transitions_bucket_state() {
        let limiter = RateLimiter::unbounded();
        // Unbounded: acquire returns immediately without advancing time.
        limiter.acquire().await;

        limiter.throttle(120).await;
        {
            let state = limiter.state.lock().await;
            assert_eq!(state.rate_per_sec, Some(2.0));
            assert_eq!(state.burst, 0.0);
            assert_eq!(state.tokens, 0.0);
        }

        limiter.restore_burst(120).await;
        let state = limiter.state.lock().await;
        assert_eq!(state.burst, 2.0);
        assert_eq!(state.tokens, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_acquire_waits_for_refill() {
        let limiter = RateLimiter::unbounded();
        limiter.throttle(60).await; // 1 token/sec, burst 0

        let start = tokio::time::Instant::now();
        let task = tokio::spawn({
            let limiter = Arc::new(limiter);
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire().await }
        });
        tokio::time::advance(Duration::from_millis(1100)).await;
        task.await.unwrap();
        assert!(tokio::time::Instant::now() >= start);
    }

    #[tokio::test]
    async fn a_throttled_tick_requeues_every_order_in_the_batch() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "60")
                    .set_body_string("No more than 100 requests per minute allowed"),
            )
            .mount(&mock_server)
            .await;

        let store: Arc<dyn Store> = Arc::new(repository::fake::FakeStore::new());
        let poller = Poller::new(store, mock_server.uri(), Duration::from_secs(2));
        let mut backlog: VecDeque<i64> = VecDeque::from([1111, 2222, 3333]);

        poller.poll_backlog(&mut backlog).await;

        let mut remaining: Vec<i64> = backlog.into_iter().collect();
        remaining.sort();
        assert_eq!(remaining, vec![1111, 2222, 3333]);

        let state = poller.limiter.state.lock().await;
        assert_eq!(state.rate_per_sec, Some(100.0 / 60.0));
        assert_eq!(state.burst, 0.0);
    }

    #[tokio::test]
    async fn tick_credits_balance_on_processed_and_drops_the_order() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "order": "7992723465",
                "status": "PROCESSED",
                "accrual": 500.0,
            })))
            .mount(&mock_server)
            .await;

        let fake = repository::fake::FakeStore::new();
        let user_id = fake.add_user("alice", b"hash").await.unwrap();
        fake.add_order(7992723465, user_id).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(fake);

        let poller = Poller::new(store.clone(), mock_server.uri(), Duration::from_secs(2));
        let mut backlog: VecDeque<i64> = VecDeque::from([7992723465]);

        poller.poll_backlog(&mut backlog).await;

        assert!(backlog.is_empty());
        assert_eq!(store.get_balance(user_id).await.unwrap().current, 500.0);
    }

    #[tokio::test]
    async fn tick_requeues_orders_still_in_process() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "order": "7992723465",
                "status": "REGISTERED",
            })))
            .mount(&mock_server)
            .await;

        let fake = repository::fake::FakeStore::new();
        let user_id = fake.add_user("alice", b"hash").await.unwrap();
        fake.add_order(7992723465, user_id).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(fake);

        let poller = Poller::new(store, mock_server.uri(), Duration::from_secs(2));
        let mut backlog: VecDeque<i64> = VecDeque::from([7992723465]);

        poller.poll_backlog(&mut backlog).await;

        assert_eq!(backlog.into_iter().collect::<Vec<_>>(), vec![7992723465]);
    }
}
