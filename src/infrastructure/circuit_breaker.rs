//! Circuit breaker shared by the Redis and PostgreSQL pools.
//!
//! While open, calls fail immediately with a `CircuitOpen` error instead of
//! waiting on connection timeouts. After `open_for` the breaker lets a
//! limited number of trial calls through; enough successes close it again,
//! any failure reopens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::metrics::BackendMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Trial successes needed to close it again
    pub success_threshold: u32,
    /// How long to stay open before letting trial calls through
    pub open_for: Duration,
    /// Concurrent trial calls allowed while half-open
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_for: Duration::from_secs(30),
            half_open_trials: 3,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { successes: u32, trials: u32 },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    since: Instant,
    trips: u64,
}

pub struct CircuitBreaker {
    backend: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(backend: &'static str) -> Self {
        Self::with_config(backend, CircuitBreakerConfig::default())
    }

    pub fn with_config(backend: &'static str, config: CircuitBreakerConfig) -> Self {
        BackendMetrics::set_circuit_state(backend, CircuitState::Closed as u8);
        Self {
            backend,
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed { failures: 0 },
                since: Instant::now(),
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is plain counters; a panic elsewhere cannot leave it invalid
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.expire_open(&mut inner);
        state_of(&inner.phase)
    }

    /// Whether a call may proceed. While half-open this reserves one of the
    /// trial slots, which the following `record_*` call releases.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        self.expire_open(&mut inner);

        match &mut inner.phase {
            Phase::Closed { .. } => true,
            Phase::Open { .. } => false,
            Phase::HalfOpen { trials, .. } => {
                if *trials >= self.config.half_open_trials {
                    return false;
                }
                *trials += 1;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();

        match &mut inner.phase {
            Phase::Closed { failures } => *failures = 0,
            Phase::HalfOpen { successes, trials } => {
                *successes += 1;
                *trials = trials.saturating_sub(1);
                if *successes >= self.config.success_threshold {
                    self.enter(&mut inner, Phase::Closed { failures: 0 });
                    tracing::info!(
                        backend = self.backend,
                        "Circuit breaker closed, backend recovered"
                    );
                }
            }
            Phase::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();

        match &mut inner.phase {
            Phase::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    let failures = *failures;
                    self.trip(&mut inner);
                    tracing::warn!(
                        backend = self.backend,
                        failures,
                        open_secs = self.config.open_for.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            Phase::HalfOpen { .. } => {
                self.trip(&mut inner);
                tracing::warn!(
                    backend = self.backend,
                    "Trial call failed, circuit breaker reopened"
                );
            }
            Phase::Open { until } => {
                // Late failure from a call admitted before opening
                *until = Instant::now() + self.config.open_for;
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.backend
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.expire_open(&mut inner);

        let (consecutive_failures, trial_successes) = match inner.phase {
            Phase::Closed { failures } => (failures, 0),
            Phase::Open { .. } => (0, 0),
            Phase::HalfOpen { successes, .. } => (0, successes),
        };

        CircuitBreakerStats {
            state: state_of(&inner.phase),
            consecutive_failures,
            trial_successes,
            seconds_in_state: inner.since.elapsed().as_secs(),
            trips: inner.trips,
        }
    }

    fn expire_open(&self, inner: &mut Inner) {
        if let Phase::Open { until } = inner.phase {
            if Instant::now() >= until {
                self.enter(inner, Phase::HalfOpen { successes: 0, trials: 0 });
                tracing::info!(
                    backend = self.backend,
                    "Circuit breaker half-open, admitting trial calls"
                );
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.trips += 1;
        self.enter(
            inner,
            Phase::Open {
                until: Instant::now() + self.config.open_for,
            },
        );
    }

    fn enter(&self, inner: &mut Inner, phase: Phase) {
        BackendMetrics::set_circuit_state(self.backend, state_of(&phase) as u8);
        inner.phase = phase;
        inner.since = Instant::now();
    }
}

fn state_of(phase: &Phase) -> CircuitState {
    match phase {
        Phase::Closed { .. } => CircuitState::Closed,
        Phase::Open { .. } => CircuitState::Open,
        Phase::HalfOpen { .. } => CircuitState::HalfOpen,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trial_successes: u32,
    pub seconds_in_state: u64,
    /// Times the breaker has opened since startup
    pub trips: u64,
}
