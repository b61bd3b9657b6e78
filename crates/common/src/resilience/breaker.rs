use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

use super::{ClientError, EndpointClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// A streak older than this starts over.
    pub window: Duration,
    /// Time spent open before a single trial call is let through.
    pub cooldown: Duration,
}

/// Permission for one call, settled by `on_success`, `on_failure` or
/// `on_neutral`. A half-open trial dropped unsettled frees the trial slot.
#[must_use]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    /// The single call let through while half-open.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    fn settle(mut self) -> bool {
        self.settled = true;
        self.trial
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
            tracing::debug!(endpoint = %self.breaker.endpoint, "half-open trial abandoned");
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: EndpointClass,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: EndpointClass, settings: BreakerSettings) -> Self {
        Self {
            endpoint,
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                streak_started: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn threshold(&self) -> u32 {
        self.settings.threshold
    }

    /// Decide whether a call may go out. Fails fast while open, and while a
    /// half-open trial is already in flight.
    pub fn admit(&self) -> Result<Admission<'_>, ClientError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => Ok(self.admission(false)),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.settings.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    drop(inner);
                    tracing::info!(endpoint = %self.endpoint, "circuit half-open; sending trial call");
                    Ok(self.admission(true))
                } else {
                    Err(self.open_error())
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.open_error())
                } else {
                    inner.trial_in_flight = true;
                    drop(inner);
                    Ok(self.admission(true))
                }
            }
        }
    }

    pub fn on_success(&self, admission: Admission<'_>) {
        let trial = admission.settle();
        let mut inner = self.lock();
        match (trial, inner.state) {
            (true, _) => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.streak_started = None;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                drop(inner);
                tracing::info!(endpoint = %self.endpoint, "circuit closed; upstream recovered");
            }
            (false, BreakerState::Closed) => {
                inner.failures = 0;
                inner.streak_started = None;
            }
            // A call admitted before the circuit opened says nothing about recovery.
            (false, _) => {}
        }
    }

    pub fn on_failure(&self, admission: Admission<'_>) {
        let trial = admission.settle();
        let now = Instant::now();
        let mut inner = self.lock();
        match (trial, inner.state) {
            (true, _) => {
                inner.trial_in_flight = false;
                self.trip(&mut inner, now);
            }
            (false, BreakerState::Closed) => {
                let expired = inner
                    .streak_started
                    .is_some_and(|at| now.duration_since(at) > self.settings.window);
                if inner.streak_started.is_none() || expired {
                    inner.streak_started = Some(now);
                    inner.failures = 0;
                }
                inner.failures += 1;
                if inner.failures >= self.settings.threshold {
                    self.trip(&mut inner, now);
                }
            }
            (false, _) => {}
        }
    }

    /// Outcome that neither proves nor disproves upstream health (e.g. a 429).
    pub fn on_neutral(&self, admission: Admission<'_>) {
        if admission.settle() {
            self.lock().trial_in_flight = false;
        }
    }

    fn admission(&self, trial: bool) -> Admission<'_> {
        Admission {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        metrics::counter!("auditor_circuit_open_total", "endpoint" => self.endpoint.as_str())
            .increment(1);
        tracing::warn!(
            endpoint = %self.endpoint,
            failures = inner.failures,
            cooldown_secs = self.settings.cooldown.as_secs(),
            "circuit opened"
        );
    }

    fn open_error(&self) -> ClientError {
        ClientError::CircuitOpen {
            endpoint: self.endpoint,
        }
    }
}
