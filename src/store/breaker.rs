use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Size of the rolling window of recent outcomes.
    pub request_volume_threshold: usize,
    /// Fraction of failures in a full window that opens the breaker.
    pub failure_ratio: f64,
    /// How long the breaker stays open before allowing a trial call.
    pub delay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: 5,
            failure_ratio: 0.5,
            delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    /// `in_trial` is set while the single trial call is outstanding.
    HalfOpen { in_trial: bool },
}

#[derive(Debug)]
struct Inner {
    state: State,
    /// Recent outcomes while closed, `true` for success.
    window: VecDeque<bool>,
}

/// A call-guarding state machine that fails fast after sustained failures.
///
/// Callers ask [`CircuitBreaker::try_acquire`] before every call and settle
/// the returned [`Permit`] with the outcome. A permit dropped unsettled, for
/// instance by a panicking or cancelled call, counts as a failure, so the
/// half-open trial can never be left outstanding.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            request_volume_threshold: config.request_volume_threshold.max(1),
            ..config
        };
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::with_capacity(config.request_volume_threshold),
            }),
        }
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.config.delay_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current state. An open breaker whose delay has elapsed reports
    /// itself as half-open.
    pub fn state(&self) -> BreakerState {
        match self.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { since } if since.elapsed() >= self.delay() => BreakerState::HalfOpen,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// A permit for one call, if one may go ahead now.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let allowed = match inner.state {
            State::Closed => true,
            State::Open { since } => {
                if since.elapsed() >= self.delay() {
                    inner.state = State::HalfOpen { in_trial: true };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { in_trial: true } => false,
            State::HalfOpen { in_trial: false } => {
                inner.state = State::HalfOpen { in_trial: true };
                true
            }
        };
        allowed.then(|| Permit {
            breaker: self,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.state {
            State::Closed => self.push_outcome(inner, true),
            State::HalfOpen { .. } => {
                inner.state = State::Closed;
                inner.window.clear();
            }
            // A call admitted before the breaker opened; it says nothing about
            // the store's current health.
            State::Open { .. } => {}
        }
    }

    /// Record a failed call. Returns `true` if this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.state {
            State::Closed => {
                self.push_outcome(inner, false);
                let window = &inner.window;
                let failures = window.iter().filter(|ok| !**ok).count();
                let full = window.len() >= self.config.request_volume_threshold;
                if full && failures as f64 / window.len() as f64 >= self.config.failure_ratio {
                    inner.state = State::Open {
                        since: Instant::now(),
                    };
                    inner.window.clear();
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { .. } => {
                inner.state = State::Open {
                    since: Instant::now(),
                };
                true
            }
            State::Open { .. } => false,
        }
    }

    fn push_outcome(&self, inner: &mut Inner, ok: bool) {
        if inner.window.len() >= self.config.request_volume_threshold {
            inner.window.pop_front();
        }
        inner.window.push_back(ok);
    }
}

/// Leave to make one call through a [`CircuitBreaker`].
#[must_use = "an unsettled permit counts as a failure when dropped"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Permit<'_> {
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Returns `true` if this failure opened the breaker.
    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.record_failure()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn breaker(delay_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            request_volume_threshold: 4,
            failure_ratio: 0.5,
            delay_ms,
        })
    }

    #[test]
    fn opens_only_once_window_is_full() {
        let breaker = breaker(10_000);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn stays_closed_below_ratio() {
        let breaker = breaker(10_000);
        for _ in 0..10 {
            breaker.record_success();
            breaker.record_success();
            breaker.record_success();
            assert!(!breaker.record_failure());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    fn tripped(delay_ms: u64) -> CircuitBreaker {
        let breaker = breaker(delay_ms);
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker
    }

    #[test]
    fn half_open_admits_single_trial() {
        let breaker = tripped(20);
        assert!(breaker.try_acquire().is_none());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let trial = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());

        trial.succeed();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().map(Permit::succeed).is_some());
    }

    #[test]
    fn failed_trial_reopens() {
        let breaker = tripped(20);
        thread::sleep(Duration::from_millis(30));
        let trial = breaker.try_acquire().unwrap();
        assert!(trial.fail());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn abandoned_trial_reopens_then_recovers() {
        let breaker = tripped(20);
        thread::sleep(Duration::from_millis(30));

        let result = thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _trial = breaker.try_acquire().unwrap();
                    panic!("store call panicked");
                })
                .join()
        });
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        thread::sleep(Duration::from_millis(30));
        breaker.try_acquire().unwrap().succeed();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
