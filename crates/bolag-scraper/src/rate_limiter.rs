//! **Adaptive Rate Limiter**
//!
//! Executes stage operations at a bounded concurrency with an inter-request
//! delay, and tunes both from a rolling window of outcomes. Two separate
//! mechanisms react to pressure:
//!
//! - the *adaptation rule* runs every 10 outcomes over the last 50: a
//!   failure rate above 20% shrinks concurrency and grows the delay, a clean
//!   full window does the opposite;
//! - the *rate-limit handler* reacts to an observed 429 immediately and more
//!   aggressively (half the workers, triple the delay).
//!
//! Provider-pool exhaustion on 429 is the proxy gateway's concern, not ours;
//! the two are deliberately kept apart.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Local, Timelike, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use bolag_core::{ScrapeError, ScrapeResult};

const WINDOW_CAPACITY: usize = 100;
const ADAPT_EVERY: usize = 10;
const ADAPT_SAMPLE: usize = 50;
const FAILURE_RATE_THRESHOLD: f64 = 0.20;
const MIN_DELAY: Duration = Duration::from_millis(100);
const GROWTH_CONCURRENCY_CAP: usize = 10;

/// Alternate limits for a nightly window. The window may wrap midnight
/// (22:00–06:00). Night values apply while the local hour is inside the
/// window and never overwrite the learned daytime baseline.
#[derive(Debug, Clone, Copy)]
pub struct NightMode {
    pub start_hour: u32,
    pub end_hour: u32,
    pub concurrent: usize,
    pub delay: Duration,
}

impl NightMode {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Per-stage limiter configuration.
#[derive(Debug, Clone)]
pub struct StageLimits {
    pub concurrent: usize,
    pub delay: Duration,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub night: Option<NightMode>,
}

impl StageLimits {
    pub fn stage1() -> Self {
        Self {
            concurrent: 5,
            delay: Duration::from_millis(100),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            night: None,
        }
    }

    pub fn stage2() -> Self {
        Self::stage1()
    }

    pub fn stage3() -> Self {
        Self {
            concurrent: 10,
            delay: Duration::from_millis(100),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            night: Some(NightMode {
                start_hour: 22,
                end_hour: 6,
                concurrent: 15,
                delay: Duration::from_millis(50),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    success: bool,
    status: Option<u16>,
    #[allow(dead_code)]
    duration: Duration,
    #[allow(dead_code)]
    timestamp: chrono::DateTime<Utc>,
}

struct LimiterState {
    learned_concurrent: usize,
    learned_delay: Duration,
    /// Permits currently issued to the semaphore
    applied_concurrent: usize,
    /// Permits to swallow as in-flight operations release
    permit_debt: usize,
    window: VecDeque<Outcome>,
    outcomes_since_adapt: usize,
    total_requests: u64,
    failed_requests: u64,
    rate_limit_hits: u64,
}

/// Serializable snapshot persisted into `Job.rate_limit_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub stage: String,
    pub concurrent: usize,
    pub delay_ms: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub rate_limit_hits: u64,
    pub recent_failure_rate: f64,
}

pub struct AdaptiveRateLimiter {
    label: String,
    limits: StageLimits,
    semaphore: Arc<Semaphore>,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(label: impl Into<String>, limits: StageLimits) -> Self {
        let concurrent = limits.concurrent.max(1);
        Self {
            label: label.into(),
            semaphore: Arc::new(Semaphore::new(concurrent)),
            state: Mutex::new(LimiterState {
                learned_concurrent: concurrent,
                learned_delay: limits.delay,
                applied_concurrent: concurrent,
                permit_debt: 0,
                window: VecDeque::with_capacity(WINDOW_CAPACITY),
                outcomes_since_adapt: 0,
                total_requests: 0,
                failed_requests: 0,
                rate_limit_hits: 0,
            }),
            limits,
        }
    }

    /// Run one operation through the FIFO worker pool with the retry ladder.
    ///
    /// 404 and 403 are never retried here. A 429 invokes the rate-limit
    /// handler and stays on the ladder. The success delay is slept while the
    /// slot is still held, pacing consecutive completions per worker.
    pub async fn execute<T, F, Fut>(&self, op: F) -> ScrapeResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        self.sync_concurrency();
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScrapeError::network("rate limiter closed"))?;
        let result = self.run_attempts(&op).await;
        self.release(permit);
        result
    }

    async fn run_attempts<T, F, Fut>(&self, op: &F) -> ScrapeResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        let max_retries = self.limits.max_retries.max(1);
        for attempt in 1..=max_retries {
            if attempt > 1 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }
            let started = Instant::now();
            match op().await {
                Ok(value) => {
                    self.record(true, None, started.elapsed());
                    tokio::time::sleep(self.effective_delay()).await;
                    return Ok(value);
                }
                Err(err) => {
                    let status = err.status();
                    self.record(false, status, started.elapsed());
                    if status == Some(429) {
                        self.on_rate_limited();
                    }
                    if !err.is_retryable() || attempt == max_retries {
                        return Err(err);
                    }
                    debug!(
                        stage = %self.label,
                        attempt,
                        error = %err,
                        "operation failed, will retry"
                    );
                }
            }
        }
        Err(ScrapeError::network("retry ladder exhausted"))
    }

    /// Exponential backoff before retry `attempt` (attempt numbering starts
    /// at 1): min(max_delay, delay × multiplier^(attempt−1) + jitter) with
    /// jitter uniform in [0, 0.1 × exponential part).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = {
            let state = self.state.lock().expect("limiter state lock");
            state.learned_delay
        };
        let exponential = delay.mul_f64(
            self.limits
                .backoff_multiplier
                .max(1.0)
                .powi(attempt.saturating_sub(1) as i32),
        );
        let jitter = exponential.mul_f64(0.1 * rand::thread_rng().gen::<f64>());
        (exponential + jitter).min(self.limits.max_delay)
    }

    /// Inter-request delay currently in force (night values when inside the
    /// configured window).
    fn effective_delay(&self) -> Duration {
        if let Some(night) = &self.limits.night {
            if night.contains(Local::now().hour()) {
                return night.delay;
            }
        }
        self.state.lock().expect("limiter state lock").learned_delay
    }

    /// Grow or shrink the semaphore toward the currently effective
    /// concurrency. Shrinking accrues debt that `release` collects as
    /// in-flight permits come back.
    fn sync_concurrency(&self) {
        let night_target = self.limits.night.as_ref().and_then(|night| {
            night.contains(Local::now().hour()).then_some(night.concurrent)
        });

        let mut state = self.state.lock().expect("limiter state lock");
        let target = night_target.unwrap_or(state.learned_concurrent).max(1);
        let effective = state.applied_concurrent - state.permit_debt;
        if target > effective {
            let mut grow = target - effective;
            let cancelled = grow.min(state.permit_debt);
            state.permit_debt -= cancelled;
            grow -= cancelled;
            if grow > 0 {
                self.semaphore.add_permits(grow);
                state.applied_concurrent += grow;
            }
        } else {
            state.permit_debt += effective - target;
        }
        // Collect as much debt as possible from idle permits right away;
        // the rest is swallowed by `release` as in-flight work finishes.
        while state.permit_debt > 0 {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    state.permit_debt -= 1;
                    state.applied_concurrent -= 1;
                }
                Err(_) => break,
            }
        }
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut state = self.state.lock().expect("limiter state lock");
        if state.permit_debt > 0 {
            state.permit_debt -= 1;
            state.applied_concurrent -= 1;
            permit.forget();
        }
    }

    fn record(&self, success: bool, status: Option<u16>, duration: Duration) {
        let mut state = self.state.lock().expect("limiter state lock");
        if state.window.len() == WINDOW_CAPACITY {
            state.window.pop_front();
        }
        state.window.push_back(Outcome {
            success,
            status,
            duration,
            timestamp: Utc::now(),
        });
        state.total_requests += 1;
        if !success {
            state.failed_requests += 1;
        }
        state.outcomes_since_adapt += 1;
        if state.outcomes_since_adapt >= ADAPT_EVERY {
            state.outcomes_since_adapt = 0;
            self.adapt(&mut state);
        }
    }

    fn adapt(&self, state: &mut LimiterState) {
        let sample: Vec<&Outcome> = state.window.iter().rev().take(ADAPT_SAMPLE).collect();
        if sample.is_empty() {
            return;
        }
        let failures = sample.iter().filter(|o| !o.success).count();
        let rate = failures as f64 / sample.len() as f64;

        if rate > FAILURE_RATE_THRESHOLD {
            let previous = state.learned_concurrent;
            state.learned_concurrent = ((state.learned_concurrent as f64 * 0.7).floor() as usize).max(1);
            state.learned_delay = state
                .learned_delay
                .mul_f64(self.limits.backoff_multiplier.max(1.0))
                .min(self.limits.max_delay);
            info!(
                stage = %self.label,
                failure_rate = rate,
                concurrent = state.learned_concurrent,
                previous,
                delay_ms = state.learned_delay.as_millis() as u64,
                "degrading throughput after failures"
            );
        } else if sample.len() == ADAPT_SAMPLE && failures == 0 {
            state.learned_concurrent = (state.learned_concurrent + 1).min(GROWTH_CONCURRENCY_CAP);
            state.learned_delay = state.learned_delay.mul_f64(0.9).max(MIN_DELAY);
            debug!(
                stage = %self.label,
                concurrent = state.learned_concurrent,
                delay_ms = state.learned_delay.as_millis() as u64,
                "recovering throughput after clean window"
            );
        }
    }

    /// Separate, more aggressive step on an observed 429.
    fn on_rate_limited(&self) {
        let mut state = self.state.lock().expect("limiter state lock");
        state.rate_limit_hits += 1;
        state.learned_concurrent = ((state.learned_concurrent as f64 * 0.5).floor() as usize).max(1);
        state.learned_delay = state.learned_delay.mul_f64(3.0).min(self.limits.max_delay);
        warn!(
            stage = %self.label,
            concurrent = state.learned_concurrent,
            delay_ms = state.learned_delay.as_millis() as u64,
            "429 observed, backing off hard"
        );
    }

    /// Lock-protected snapshot for operators and checkpoints.
    pub fn stats(&self) -> RateLimitStats {
        let state = self.state.lock().expect("limiter state lock");
        let sample: Vec<&Outcome> = state.window.iter().rev().take(ADAPT_SAMPLE).collect();
        let recent_failure_rate = if sample.is_empty() {
            0.0
        } else {
            sample.iter().filter(|o| !o.success).count() as f64 / sample.len() as f64
        };
        RateLimitStats {
            stage: self.label.clone(),
            concurrent: state.learned_concurrent,
            delay_ms: state.learned_delay.as_millis() as u64,
            total_requests: state.total_requests,
            failed_requests: state.failed_requests,
            rate_limit_hits: state.rate_limit_hits,
            recent_failure_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_limits(concurrent: usize, delay_ms: u64) -> StageLimits {
        StageLimits {
            concurrent,
            delay: Duration::from_millis(delay_ms),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            night: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_work_set_completes_with_paced_throughput() {
        let limiter = Arc::new(AdaptiveRateLimiter::new("test", quick_limits(2, 100)));
        let completed = Arc::new(AtomicU32::new(0));

        let started = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let completed = completed.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(|| async { Ok::<_, ScrapeError>(()) })
                    .await
                    .unwrap();
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(completed.load(Ordering::SeqCst), 6);
        // 6 ops over 2 slots with a 100ms delay per completion
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let limiter = AdaptiveRateLimiter::new("test", quick_limits(1, 10));
        let calls = AtomicU32::new(0);
        let result = limiter
            .execute(|| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ScrapeError::network("connection reset"))
                    } else {
                        Ok(41 + 1)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_404_or_403() {
        for status in [404u16, 403] {
            let limiter = AdaptiveRateLimiter::new("test", quick_limits(1, 10));
            let calls = AtomicU32::new(0);
            let result: ScrapeResult<()> = limiter
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(ScrapeError::UpstreamStatus { status }) }
                })
                .await;
            assert!(matches!(
                result,
                Err(ScrapeError::UpstreamStatus { status: s }) if s == status
            ));
            assert_eq!(calls.load(Ordering::SeqCst), 1, "status {}", status);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_halves_concurrency_and_triples_delay() {
        let limiter = AdaptiveRateLimiter::new("test", quick_limits(10, 100));
        let _ = limiter
            .execute(|| async { Err::<(), _>(ScrapeError::UpstreamStatus { status: 429 }) })
            .await;

        let stats = limiter.stats();
        // three attempts, each observing a 429: 10 -> 5 -> 2 -> 1
        assert_eq!(stats.rate_limit_hits, 3);
        assert_eq!(stats.concurrent, 1);
        // delay tripled (capped by max_delay = 5s): 100 -> 300 -> 900 -> 2700
        assert_eq!(stats.delay_ms, 2700);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptation_degrades_on_high_failure_rate() {
        let limiter = AdaptiveRateLimiter::new("test", quick_limits(5, 100));
        // 10 outcomes: 6 ok, 4 * 404 (non-retryable, one outcome each) = 40%
        for i in 0..10 {
            let _ = limiter
                .execute(|| async move {
                    if i % 3 == 0 {
                        Err::<(), _>(ScrapeError::UpstreamStatus { status: 404 })
                    } else {
                        Ok(())
                    }
                })
                .await;
        }
        let stats = limiter.stats();
        assert_eq!(stats.concurrent, 3); // floor(5 * 0.7)
        assert_eq!(stats.delay_ms, 200); // 100 * backoff_multiplier
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptation_recovers_after_clean_full_window() {
        let limiter = AdaptiveRateLimiter::new("test", quick_limits(5, 200));
        for _ in 0..ADAPT_SAMPLE {
            limiter
                .execute(|| async { Ok::<_, ScrapeError>(()) })
                .await
                .unwrap();
        }
        let stats = limiter.stats();
        assert_eq!(stats.concurrent, 6);
        assert!(stats.delay_ms < 200);
        assert_eq!(stats.recent_failure_rate, 0.0);
    }

    #[test]
    fn test_night_window_wraps_midnight() {
        let night = NightMode {
            start_hour: 22,
            end_hour: 6,
            concurrent: 15,
            delay: Duration::from_millis(50),
        };
        assert!(night.contains(22));
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(12));
        assert!(!night.contains(21));
    }

    #[test]
    fn test_stage_defaults() {
        assert_eq!(StageLimits::stage1().concurrent, 5);
        assert_eq!(StageLimits::stage2().concurrent, 5);
        let stage3 = StageLimits::stage3();
        assert_eq!(stage3.concurrent, 10);
        let night = stage3.night.unwrap();
        assert!(night.concurrent > stage3.concurrent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_collects_permits_as_debt() {
        let limiter = Arc::new(AdaptiveRateLimiter::new("test", quick_limits(4, 10)));
        // Trigger the aggressive handler to shrink 4 -> 2.
        let _ = limiter
            .execute(|| async { Err::<(), _>(ScrapeError::UpstreamStatus { status: 404 }) })
            .await;
        {
            let mut state = limiter.state.lock().unwrap();
            state.learned_concurrent = 2;
        }
        limiter.sync_concurrency();
        // After syncing, at most 2 operations may run at once.
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(|| async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ScrapeError>(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
