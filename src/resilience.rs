//! Timeout, bounded retry with exponential backoff, circuit breaker and an
//! in-flight cap for each external dependency.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::resilience as tuning;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Circuit {
    Closed,
    Open { until: Instant },
    /// One trial call allowed; `in_flight` while it runs.
    HalfOpen { in_flight: bool },
}

#[derive(Debug)]
struct BreakerInner {
    circuit: Circuit,
    consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                circuit: Circuit::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a call may proceed now. An expired open circuit moves to
    /// half-open and admits exactly one trial.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.circuit {
            Circuit::Closed => true,
            Circuit::Open { until } if Instant::now() >= until => {
                info!(dependency = self.name, "[RESILIENCE] breaker half-open, allowing trial call");
                inner.circuit = Circuit::HalfOpen { in_flight: true };
                true
            }
            Circuit::Open { .. } => false,
            Circuit::HalfOpen { in_flight: true } => false,
            Circuit::HalfOpen { in_flight: false } => {
                inner.circuit = Circuit::HalfOpen { in_flight: true };
                true
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if !matches!(inner.circuit, Circuit::Closed) {
            info!(dependency = self.name, "[RESILIENCE] breaker closed");
        }
        inner.circuit = Circuit::Closed;
        inner.consecutive_failures = 0;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let reopen = matches!(inner.circuit, Circuit::HalfOpen { .. });
        if reopen || inner.consecutive_failures >= self.threshold {
            inner.circuit = Circuit::Open {
                until: Instant::now() + self.cooldown,
            };
            error!(
                event = "CIRCUIT_OPEN",
                dependency = self.name,
                failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "[RESILIENCE] breaker opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.lock().circuit {
            Circuit::Closed => BreakerState::Closed,
            Circuit::Open { until } if Instant::now() >= until => BreakerState::HalfOpen,
            Circuit::Open { .. } => BreakerState::Open,
            Circuit::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: tuning::MAX_RETRIES,
            initial_delay_ms: tuning::INITIAL_BACKOFF_MS,
            multiplier: tuning::BACKOFF_MULTIPLIER,
            max_delay_ms: tuning::MAX_BACKOFF_MS,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Base delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let extra = base.as_millis() as f64 * self.jitter * rand::thread_rng().gen::<f64>();
        base + Duration::from_millis(extra as u64)
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Everything wrapped around calls to one dependency.
pub struct Guard {
    name: &'static str,
    timeout: Duration,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    permits: Semaphore,
}

impl Guard {
    pub fn new(name: &'static str, timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            name,
            timeout,
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::new(
                name,
                tuning::BREAKER_FAILURE_THRESHOLD,
                Duration::from_secs(tuning::BREAKER_COOLDOWN_SECS),
            ),
            permits: Semaphore::new(max_in_flight.max(1)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(self.name, threshold, cooldown);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `op` under the in-flight cap, timeout and retry policy.
    /// Non-transient errors are returned without retrying.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| AppError::CircuitOpen { dependency: self.name })?;

        let mut attempt = 0u32;
        loop {
            if !self.breaker.try_acquire() {
                return Err(AppError::CircuitOpen { dependency: self.name });
            }

            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(AppError::Timeout { dependency: self.name }),
            };

            match result {
                Ok(v) => {
                    self.breaker.on_success();
                    return Ok(v);
                }
                Err(e) if e.is_transient() => {
                    self.breaker.on_failure();
                    if attempt >= self.retry.max_retries {
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    warn!(
                        dependency = self.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "[RESILIENCE] transient failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    // The dependency answered; it is healthy even if the request was bad.
                    self.breaker.on_success();
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.base_delay(0), Duration::from_millis(500));
        assert_eq!(p.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(p.base_delay(5), Duration::from_millis(4_000));
        let d = p.delay(0);
        assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(600));
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let b = CircuitBreaker::new("feed", 2, Duration::from_millis(0));
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.on_failure();
        // zero cooldown: already eligible for a trial
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire());
        assert!(!b.try_acquire());
        b.on_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_trial_reopens() {
        let b = CircuitBreaker::new("llm", 1, Duration::from_secs(60));
        b.on_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.try_acquire());
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_succeed() {
        let guard = Guard::new("feed", Duration::from_secs(1), 1).with_retry(fast_retry());
        let calls = AtomicU32::new(0);
        let out = guard
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AppError::Feed("502".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(guard.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let guard = Guard::new("telegram", Duration::from_secs(1), 1).with_retry(fast_retry());
        let calls = AtomicU32::new(0);
        let res: Result<()> = guard
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::BadRequest("chat not found".to_string())) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let guard = Guard::new("llm", Duration::from_secs(1), 1)
            .with_retry(RetryPolicy { max_retries: 0, ..fast_retry() })
            .with_breaker(1, Duration::from_secs(60));
        let first: Result<()> = guard.call(|| async { Err(AppError::Llm("down".to_string())) }).await;
        assert!(matches!(first, Err(AppError::Llm(_))));
        let second: Result<()> = guard.call(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(AppError::CircuitOpen { dependency: "llm" })));
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let guard = Guard::new("feed", Duration::from_millis(10), 1)
            .with_retry(RetryPolicy { max_retries: 0, ..fast_retry() });
        let res: Result<()> = guard
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(AppError::Timeout { dependency: "feed" })));
    }
}
