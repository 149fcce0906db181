//! Per-provider circuit breaker
//!
//! Three states: CLOSED lets calls through and counts consecutive failures,
//! OPEN rejects calls without touching the provider, HALF_OPEN admits exactly
//! one trial call once `recovery_timeout` has passed since the last failure.
//!
//! Each breaker owns its own lock; nothing here performs I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Seconds after the last failure before a trial call is allowed
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Error from [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open for provider '{0}'")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

/// Circuit breaker for one provider; clones share state
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Point-in-time view of a breaker, for status output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Seconds until a trial call is allowed, when open
    pub retry_in_secs: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    last_failure: None,
                    next_attempt_at: None,
                    trial_in_flight: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State is plain counters; a panic mid-update cannot leave it unusable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, without side effects
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether `try_acquire` would currently succeed, without claiming a slot
    pub fn allows_request(&self) -> bool {
        let state = self.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => state
                .next_attempt_at
                .is_none_or(|at| Instant::now() >= at),
            CircuitState::HalfOpen => !state.trial_in_flight,
        }
    }

    /// Claim permission for one call
    ///
    /// In OPEN, the first caller at or after the recovery deadline moves the
    /// breaker to HALF_OPEN and becomes the trial; everyone else gets
    /// `Error::CircuitOpen` until the trial resolves.
    pub fn try_acquire(&self) -> Result<BreakerPermit> {
        let mut state = self.lock();
        let trial = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let ready = state
                    .next_attempt_at
                    .is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return Err(Error::CircuitOpen(self.inner.name.clone()));
                }
                state.state = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                info!(provider = %self.inner.name, "Circuit breaker HALF-OPEN, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(Error::CircuitOpen(self.inner.name.clone()));
                }
                state.trial_in_flight = true;
                debug!(provider = %self.inner.name, "Admitting trial call");
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self.clone(),
            trial,
            resolved: false,
        })
    }

    /// Run `f` through the breaker
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self
            .try_acquire()
            .map_err(|_| BreakerError::Open(self.inner.name.clone()))?;

        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.last_failure = None;
                state.next_attempt_at = None;
                state.trial_in_flight = false;
                info!(provider = %self.inner.name, "Circuit breaker CLOSED after successful trial");
            }
            // A call admitted before the circuit opened; it says nothing about recovery.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let recovery = self.inner.config.recovery_timeout();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.last_failure = Some(now);
                if state.consecutive_failures >= self.inner.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.next_attempt_at = Some(now + recovery);
                    error!(
                        provider = %self.inner.name,
                        failures = state.consecutive_failures,
                        "Circuit breaker OPENED"
                    );
                } else {
                    debug!(
                        provider = %self.inner.name,
                        failures = state.consecutive_failures,
                        "Provider failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                state.state = CircuitState::Open;
                state.consecutive_failures += 1;
                state.last_failure = Some(now);
                state.next_attempt_at = Some(now + recovery);
                state.trial_in_flight = false;
                warn!(provider = %self.inner.name, "Circuit breaker re-OPENED after failed trial");
            }
            CircuitState::HalfOpen => {}
            CircuitState::Open => {
                state.consecutive_failures += 1;
                state.last_failure = Some(now);
                state.next_attempt_at = Some(now + recovery);
            }
        }
    }

    fn release_trial(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.trial_in_flight {
            state.trial_in_flight = false;
            debug!(provider = %self.inner.name, "Trial call abandoned, slot released");
        }
    }

    /// Point-in-time view for status output
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        let retry_in_secs = match state.state {
            CircuitState::Open => state.next_attempt_at.map(|at| {
                at.saturating_duration_since(Instant::now())
                    .as_secs_f64()
                    .ceil() as u64
            }),
            _ => None,
        };

        BreakerSnapshot {
            provider: self.inner.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            retry_in_secs,
        }
    }
}

/// Permission for one call through a breaker
///
/// Resolve it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unresolved (e.g. on cancellation) frees the trial slot without
/// counting a failure.
#[derive(Debug)]
#[must_use = "resolve the permit with success() or failure()"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// One breaker per provider, created at startup
#[derive(Debug, Clone, Default)]
pub struct BreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new<I, S>(providers: I, config: BreakerConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let breakers = providers
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), CircuitBreaker::new(name, config))
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(provider)
    }

    /// Snapshots of every breaker, sorted by provider name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.breakers.values().map(CircuitBreaker::snapshot).collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_secs: 60,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3);

        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen(_))));
        assert!(!breaker.allows_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3);

        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().failure();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.try_acquire().unwrap();
        for _ in 0..5 {
            assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen(_))));
        }

        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().retry_in_secs, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_half_open_callers_get_one_trial() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let racers: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let permit = breaker.try_acquire().ok();
                    // Hold the permit until every racer has tried
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    permit.map(|p| {
                        let trial = p.is_trial();
                        p.success();
                        trial
                    })
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for racer in racers {
            if let Some(trial) = racer.await.unwrap() {
                admitted.push(trial);
            }
        }
        assert_eq!(admitted, vec![true]);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breaker = breaker(1);
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(60)).await;

        let trial = breaker.try_acquire().unwrap();
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allows_request());
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_does_not_invoke_when_open() {
        let breaker = breaker(1);
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;

        let mut invoked = false;
        let result = breaker
            .call(|| {
                invoked = true;
                async { Ok::<_, &str>(()) }
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert!(!invoked);
    }

    #[test]
    fn test_registry_snapshots_sorted() {
        let registry = BreakerRegistry::new(["zeta", "alpha"], BreakerConfig::default());
        let names: Vec<String> = registry
            .snapshots()
            .into_iter()
            .map(|s| s.provider)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("missing").is_none());
    }
}
