pub mod retry;

pub use retry::RetryPolicy;

use crate::api::{ExchangeError, RateBudget};
use crate::settings::{FetchSettings, Settings};
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Fetch cancelled by shutdown")]
    Cancelled,
}

/// Per-symbol outcomes of one fetch, in input order
#[derive(Debug)]
pub struct FetchReport<T> {
    pub results: Vec<(String, Result<T, FetchError>)>,
    pub batches: usize,
}

impl<T> FetchReport<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Throttled, batched fan-out of per-symbol exchange requests.
///
/// Batches run one after another with a fixed delay in between. Inside a batch, requests
/// run concurrently up to `max_concurrent`, each start spaced by the stagger pacer and
/// admitted by the shared [`RateBudget`].
pub struct BatchFetcher {
    batch_size: usize,
    batch_delay: Duration,
    request_timeout: Duration,
    ban_backoff: Duration,
    retry: RetryPolicy,
    budget: Arc<RateBudget>,
    semaphore: Semaphore,
    pacer: Option<DefaultDirectRateLimiter>,
}

impl BatchFetcher {
    pub fn new(settings: &Settings, budget: Arc<RateBudget>) -> Self {
        Self::with_fetch_settings(&settings.fetch, settings.exchange.request_timeout(), budget)
    }

    pub fn with_fetch_settings(
        fetch: &FetchSettings,
        request_timeout: Duration,
        budget: Arc<RateBudget>,
    ) -> Self {
        // One request start per stagger period, no bursts
        let pacer = Quota::with_period(fetch.request_stagger()).map(RateLimiter::direct);

        Self {
            batch_size: fetch.batch_size.max(1),
            batch_delay: fetch.batch_delay(),
            request_timeout,
            ban_backoff: fetch.ban_backoff(),
            retry: RetryPolicy::from_settings(fetch),
            budget,
            semaphore: Semaphore::new(fetch.max_concurrent.max(1)),
            pacer,
        }
    }

    pub fn budget(&self) -> &Arc<RateBudget> {
        &self.budget
    }

    /// Number of batches `symbol_count` symbols will be split into
    pub fn batch_count(&self, symbol_count: usize) -> usize {
        symbol_count.div_ceil(self.batch_size)
    }

    /// Run `op` for every symbol, charging `cost` weight per attempt.
    ///
    /// The shutdown flag is checked before each batch; once set, the current batch is
    /// allowed to finish and every remaining symbol is reported as cancelled.
    pub async fn fetch<T, F, Fut>(
        &self,
        symbols: &[String],
        cost: u32,
        shutdown: &watch::Receiver<bool>,
        op: F,
    ) -> FetchReport<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let total = self.batch_count(symbols.len());
        let mut results = Vec::with_capacity(symbols.len());
        let mut batches = 0;

        for (index, chunk) in symbols.chunks(self.batch_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch_delay).await;
            }

            if *shutdown.borrow() {
                let remaining = &symbols[index * self.batch_size..];
                tracing::info!(
                    "Shutdown requested, skipping {} remaining symbols",
                    remaining.len()
                );
                results.extend(
                    remaining
                        .iter()
                        .map(|s| (s.clone(), Err(FetchError::Cancelled))),
                );
                break;
            }

            batches += 1;
            tracing::debug!("Batch {}/{}: {} symbols", index + 1, total, chunk.len());

            let outcomes = join_all(chunk.iter().map(|symbol| self.fetch_one(symbol, cost, &op))).await;
            let failed = outcomes.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                tracing::warn!("Batch {}/{}: {} of {} symbols failed", index + 1, total, failed, chunk.len());
            }

            results.extend(chunk.iter().cloned().zip(outcomes));
        }

        let report = FetchReport { results, batches };
        tracing::info!(
            "Fetched {}/{} symbols in {} batches ({} failed)",
            report.succeeded(),
            report.results.len(),
            report.batches,
            report.failed()
        );
        report
    }

    async fn fetch_one<T, F, Fut>(&self, symbol: &str, cost: u32, op: &F) -> Result<T, FetchError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;

        loop {
            let result = {
                // Held for the request only, released before any backoff sleep
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| FetchError::Cancelled)?;

                if let Some(pacer) = &self.pacer {
                    pacer.until_ready().await;
                }
                self.budget.acquire(cost).await;

                match tokio::time::timeout(self.request_timeout, op(symbol.to_string())).await {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::Timeout),
                }
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if let ExchangeError::Banned { retry_after } = &err {
                let backoff = retry_after.unwrap_or_default().max(self.ban_backoff);
                tracing::error!(
                    symbol = %symbol,
                    "Exchange ban, blocking all requests for {}s",
                    backoff.as_secs()
                );
                self.budget.penalize(backoff);
                return Err(err.into());
            }

            if !err.is_retryable() || attempt >= self.retry.max_retries {
                tracing::warn!(symbol = %symbol, "Fetch failed after {} attempts: {}", attempt + 1, err);
                return Err(err.into());
            }

            let delay = self.retry.delay(attempt, err.retry_after());
            tracing::warn!(
                symbol = %symbol,
                "Fetch attempt {} failed ({}), retrying in {:.1}s",
                attempt + 1,
                err,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn fetch_settings() -> FetchSettings {
        FetchSettings {
            request_stagger_ms: 0,
            retry_jitter_ms: 0,
            ..FetchSettings::default()
        }
    }

    fn fetcher(fetch: FetchSettings) -> BatchFetcher {
        let budget = Arc::new(RateBudget::new(2400, 0.8, Duration::from_secs(60)));
        BatchFetcher::with_fetch_settings(&fetch, Duration::from_secs(30), budget)
    }

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{}USDT", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_541_symbols_issue_11_batches_with_delays() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let symbols = symbols(541);

        let start = Instant::now();
        let report = fetcher
            .fetch(&symbols, 1, &rx, |s| async move { Ok::<_, ExchangeError>(s.len()) })
            .await;

        assert_eq!(report.batches, 11);
        assert_eq!(report.results.len(), 541);
        assert_eq!(report.succeeded(), 541);
        // Ten gaps between eleven instant batches
        assert_eq!(start.elapsed(), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let symbols = symbols(120);

        let report = fetcher
            .fetch(&symbols, 1, &rx, |s| async move { Ok::<_, ExchangeError>(s) })
            .await;

        for ((symbol, result), expected) in report.results.iter().zip(&symbols) {
            assert_eq!(symbol, expected);
            assert_eq!(result.as_ref().unwrap(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        fetcher
            .fetch(&symbols(50), 1, &rx, |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ExchangeError>(())
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let report = fetcher
            .fetch(&symbols(1), 1, &rx, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ExchangeError::Server { status: 502 })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.results[0].1, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let report = fetcher
            .fetch(&symbols(1), 1, &rx, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ExchangeError::Timeout)
                }
            })
            .await;

        // First attempt plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried_and_isolated() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let symbols = vec!["GOODUSDT".to_string(), "GONEUSDT".to_string()];

        let report = fetcher
            .fetch(&symbols, 1, &rx, |s| async move {
                if s == "GONEUSDT" {
                    Err(ExchangeError::NotFound(s))
                } else {
                    Ok(1)
                }
            })
            .await;

        assert!(report.results[0].1.is_ok());
        assert_eq!(
            report.results[1].1,
            Err(FetchError::Exchange(ExchangeError::NotFound("GONEUSDT".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_request_times_out() {
        let budget = Arc::new(RateBudget::new(2400, 0.8, Duration::from_secs(60)));
        let fetch = FetchSettings {
            max_retries: 0,
            ..fetch_settings()
        };
        let fetcher = BatchFetcher::with_fetch_settings(&fetch, Duration::from_secs(2), budget);
        let (_tx, rx) = watch::channel(false);

        let report = fetcher
            .fetch(&symbols(1), 1, &rx, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ExchangeError>(())
            })
            .await;

        assert_eq!(
            report.results[0].1,
            Err(FetchError::Exchange(ExchangeError::Timeout))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_penalizes_budget_without_retry() {
        let fetcher = fetcher(fetch_settings());
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));

        fetcher
            .fetch(&symbols(1), 1, &rx, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ExchangeError::Banned {
                        retry_after: Some(Duration::from_secs(60)),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.budget().blocked_for(), Some(Duration::from_secs(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_remaining_batches() {
        let fetcher = fetcher(fetch_settings());
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);

        let report = fetcher
            .fetch(&symbols(120), 1, &rx, |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(true);
                    Ok::<_, ExchangeError>(())
                }
            })
            .await;

        assert_eq!(report.batches, 1);
        assert_eq!(report.succeeded(), 50);
        assert!(report.results[50..]
            .iter()
            .all(|(_, r)| *r == Err(FetchError::Cancelled)));
    }
}
