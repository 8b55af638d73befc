//! Circuit breaker guarding calls to the external AI service.
//!
//! Tracks CLOSED/OPEN/HALF_OPEN state so a failing dependency is not
//! hammered: once the failure threshold is hit the breaker fails fast
//! without attempting the call, and after the reset timeout it lets a
//! limited number of trial calls through before closing again.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning. Defaults match the production values: open after 5
/// consecutive failures, retry after 30s, close again after 2 successes.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays OPEN before a trial call is allowed.
    pub reset_timeout: Duration,
    /// Successes required in HALF_OPEN to close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    /// The circuit is open and the reset timeout has not elapsed; the
    /// underlying call was never attempted.
    #[error("circuit breaker is open, call rejected")]
    Open,
    #[error(transparent)]
    Call(#[from] anyhow::Error),
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Runs `op` through the breaker. Fails fast with `BreakerError::Open`
    /// when the circuit is open, otherwise records the call's outcome.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Call(e))
            }
        }
    }

    fn before_call(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed > self.config.reset_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.successes = 0;
                tracing::info!("Circuit breaker transitioning to HALF_OPEN");
            } else {
                return Err(BreakerError::Open);
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    tracing::info!("Circuit breaker CLOSED, service recovered");
                }
            }
            _ => inner.failures = 0,
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen || inner.failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            tracing::warn!(failures = inner.failures, "Circuit breaker OPEN");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn failing_call(breaker: &CircuitBreaker) -> Result<(), BreakerError> {
        breaker
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
            .map(|_| ())
    }

    async fn succeeding_call(breaker: &CircuitBreaker) -> Result<(), BreakerError> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_failure_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            assert!(matches!(
                failing_call(&breaker).await,
                Err(BreakerError::Call(_))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // The next call must be rejected without attempting the operation.
        let attempted = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(attempted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_two_successes() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(succeeding_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeeding_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn any_half_open_failure_reopens() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(succeeding_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = failing_call(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_success_resets_failure_counter() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeeding_call(&breaker).await.is_ok());
        // Four more failures still do not reach the threshold.
        for _ in 0..4 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
