//! Per-action circuit breakers.
//!
//! A breaker models the health of one external capability, so breakers are
//! keyed by action name and shared by every execution in the process. Each
//! breaker is mutated only while holding its `DashMap` entry lock, which
//! serializes concurrent updates for the same action.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use taskloom_types::config::BreakerSettings;
use taskloom_types::error::CircuitOpenError;
use taskloom_types::event::CircuitState;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    /// Normal operation.
    Closed,
    /// Rejecting calls until the cool-down elapses.
    Open { opened_at: Instant },
    /// Cool-down elapsed; one trial call decides the next state.
    HalfOpen { trial_in_flight: bool },
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial call.
    Trial,
}

/// A state change, reported so callers can record it as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Sliding-window circuit breaker for one action.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failures: VecDeque<Instant>,
    failure_threshold: u32,
    window: Duration,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(settings: &BreakerSettings) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            failure_threshold: settings.failure_threshold.max(1),
            window: Duration::from_secs(settings.window_secs),
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Failures currently counted in the window.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Ask to make a call.
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open and
    /// admits exactly one trial; everyone else is rejected until the trial
    /// reports back.
    pub fn try_acquire(&mut self, now: Instant) -> Option<(Admission, Option<Transition>)> {
        match self.state {
            BreakerState::Closed => Some((Admission::Normal, None)),
            BreakerState::Open { opened_at } => {
                if now.duration_since(opened_at) >= self.cooldown {
                    self.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Some((
                        Admission::Trial,
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    ))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    None
                } else {
                    self.state = BreakerState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Some((Admission::Trial, None))
                }
            }
        }
    }

    /// Give back a trial slot whose call never reported, so the next caller
    /// can take the trial instead.
    pub fn release_trial(&mut self) {
        if let BreakerState::HalfOpen {
            trial_in_flight: true,
        } = self.state
        {
            self.state = BreakerState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    /// The capability answered (success or a permanent error).
    pub fn record_success(&mut self, admission: Admission) -> Option<Transition> {
        match (self.state, admission) {
            (BreakerState::HalfOpen { .. }, Admission::Trial) => {
                self.state = BreakerState::Closed;
                self.failures.clear();
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            }
            _ => None,
        }
    }

    /// The capability failed transiently (error or timeout).
    pub fn record_failure(&mut self, admission: Admission, now: Instant) -> Option<Transition> {
        match (self.state, admission) {
            (BreakerState::HalfOpen { .. }, Admission::Trial) => {
                self.state = BreakerState::Open { opened_at: now };
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            (BreakerState::Closed, _) => {
                self.failures.push_back(now);
                while let Some(&oldest) = self.failures.front() {
                    if now.duration_since(oldest) > self.window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failures.len() >= self.failure_threshold as usize {
                    self.state = BreakerState::Open { opened_at: now };
                    self.failures.clear();
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            // Late results from calls admitted before the circuit opened.
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide breakers keyed by action name.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    settings: BreakerSettings,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    /// Admit or reject a call to `action`.
    pub fn acquire(
        &self,
        action: &str,
    ) -> Result<(Admission, Option<Transition>), CircuitOpenError> {
        let mut breaker = self
            .breakers
            .entry(action.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.settings));
        breaker
            .try_acquire(Instant::now())
            .ok_or_else(|| CircuitOpenError {
                action: action.to_string(),
            })
    }

    /// Report the outcome of an admitted call. `healthy` is false for
    /// transient failures and timeouts.
    pub fn record(&self, action: &str, admission: Admission, healthy: bool) -> Option<Transition> {
        let mut breaker = self.breakers.get_mut(action)?;
        if healthy {
            breaker.record_success(admission)
        } else {
            breaker.record_failure(admission, Instant::now())
        }
    }

    /// Release a half-open trial admission that was abandoned mid-call.
    pub fn release_trial(&self, action: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(action) {
            breaker.release_trial();
        }
    }

    /// Current state; unknown actions are closed.
    pub fn state(&self, action: &str) -> CircuitState {
        self.breakers
            .get(action)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Every tracked action with its state, sorted by action name.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut out: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(&settings(3));
        let now = Instant::now();
        assert!(breaker.record_failure(Admission::Normal, now).is_none());
        assert!(breaker.record_failure(Admission::Normal, now).is_none());
        let t = breaker.record_failure(Admission::Normal, now).unwrap();
        assert_eq!(t.to, CircuitState::Open);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire(now).is_none());
    }

    #[test]
    fn test_failures_outside_window_expire() {
        let mut breaker = CircuitBreaker::new(&settings(2));
        let start = Instant::now();
        breaker.record_failure(Admission::Normal, start);
        let later = start + Duration::from_secs(61);
        assert!(breaker.record_failure(Admission::Normal, later).is_none());
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let mut breaker = CircuitBreaker::new(&settings(1));
        let start = Instant::now();
        breaker.record_failure(Admission::Normal, start);

        assert!(breaker.try_acquire(start + Duration::from_secs(10)).is_none());

        let after = start + Duration::from_secs(30);
        let (admission, transition) = breaker.try_acquire(after).unwrap();
        assert_eq!(admission, Admission::Trial);
        assert_eq!(transition.unwrap().to, CircuitState::HalfOpen);
        assert!(breaker.try_acquire(after).is_none());

        let t = breaker.record_success(Admission::Trial).unwrap();
        assert_eq!(t.to, CircuitState::Closed);
        assert_eq!(breaker.try_acquire(after).unwrap().0, Admission::Normal);
    }

    #[test]
    fn test_released_trial_admits_next_caller() {
        let mut breaker = CircuitBreaker::new(&settings(1));
        let start = Instant::now();
        breaker.record_failure(Admission::Normal, start);
        let after = start + Duration::from_secs(30);
        assert_eq!(breaker.try_acquire(after).unwrap().0, Admission::Trial);
        assert!(breaker.try_acquire(after).is_none());

        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(after).unwrap().0, Admission::Trial);

        // No effect outside a held trial.
        breaker.record_success(Admission::Trial);
        breaker.release_trial();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trial_failure_reopens() {
        let mut breaker = CircuitBreaker::new(&settings(1));
        let start = Instant::now();
        breaker.record_failure(Admission::Normal, start);
        let after = start + Duration::from_secs(31);
        let (admission, _) = breaker.try_acquire(after).unwrap();

        let t = breaker.record_failure(admission, after).unwrap();
        assert_eq!(t, Transition { from: CircuitState::HalfOpen, to: CircuitState::Open });
        assert!(breaker.try_acquire(after + Duration::from_secs(29)).is_none());
        assert!(breaker.try_acquire(after + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn test_late_normal_results_ignored_while_open() {
        let mut breaker = CircuitBreaker::new(&settings(1));
        let now = Instant::now();
        breaker.record_failure(Admission::Normal, now);
        assert!(breaker.record_success(Admission::Normal).is_none());
        assert!(breaker.record_failure(Admission::Normal, now).is_none());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_isolates_actions() {
        let registry = BreakerRegistry::new(settings(2));
        for _ in 0..2 {
            let (adm, _) = registry.acquire("flaky").unwrap();
            registry.record("flaky", adm, false);
        }
        assert_eq!(registry.state("flaky"), CircuitState::Open);
        assert!(registry.acquire("flaky").is_err());
        assert!(registry.acquire("steady").is_ok());
        assert_eq!(registry.state("never-seen"), CircuitState::Closed);
        assert_eq!(
            registry.states(),
            vec![
                ("flaky".to_string(), CircuitState::Open),
                ("steady".to_string(), CircuitState::Closed)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_not_lost() {
        let registry = std::sync::Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: 1000,
            window_secs: 600,
            cooldown_secs: 30,
        }));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..125 {
                    let (adm, _) = registry.acquire("shared").unwrap();
                    registry.record("shared", adm, false);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Exactly the 1000th failure trips the breaker.
        assert_eq!(registry.state("shared"), CircuitState::Open);
    }
}
