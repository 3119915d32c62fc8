//! Per-step circuit breakers.
//!
//! Process-wide state shared across runs: three consecutive failures open
//! a step's circuit, an open circuit rejects calls outright, and the
//! first call after the reset interval is allowed through (implicit
//! half-open). Any success clears the counters.

use aegis_types::StepName;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker policy.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub fail_threshold: u32,
    pub reset_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            reset_ms: 30_000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
    open: bool,
}

/// Registry of breaker states keyed by step.
pub struct CircuitBreakerRegistry {
    states: Mutex<HashMap<StepName, BreakerState>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether a call to this step must be rejected right now. After the
    /// reset interval the call is allowed; the outcome then decides
    /// whether the circuit clears or re-opens.
    pub fn is_open(&self, step: StepName) -> bool {
        let guard = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(state) = guard.get(&step) else {
            return false;
        };
        if !state.open {
            return false;
        }
        match state.last_failure {
            Some(last) => {
                last.elapsed() < Duration::from_millis(self.config.reset_ms)
            }
            None => false,
        }
    }

    pub fn record_success(&self, step: StepName) {
        let mut guard = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(step, BreakerState::default());
    }

    pub fn record_failure(&self, step: StepName) {
        let mut guard = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = guard.entry(step).or_default();
        state.failures += 1;
        state.last_failure = Some(Instant::now());
        if state.failures >= self.config.fail_threshold {
            if !state.open {
                tracing::warn!(step = %step, failures = state.failures, "circuit opened");
            }
            state.open = true;
        }
    }

    /// Consecutive failures recorded for a step.
    pub fn failures(&self, step: StepName) -> u32 {
        let guard = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(&step).map(|s| s.failures).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_three_consecutive_failures() {
        let registry = make_registry();
        let step = StepName::RiskSignals;

        registry.record_failure(step);
        registry.record_failure(step);
        assert!(!registry.is_open(step));

        registry.record_failure(step);
        assert!(registry.is_open(step));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_counter() {
        let registry = make_registry();
        let step = StepName::KbLookup;

        registry.record_failure(step);
        registry.record_failure(step);
        registry.record_success(step);
        assert_eq!(registry.failures(step), 0);

        registry.record_failure(step);
        registry.record_failure(step);
        assert!(!registry.is_open(step));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_interval_allows_a_probe_call() {
        let registry = make_registry();
        let step = StepName::Decide;
        for _ in 0..3 {
            registry.record_failure(step);
        }
        assert!(registry.is_open(step));

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(!registry.is_open(step));

        // The probe failing slams the circuit shut again immediately.
        registry.record_failure(step);
        assert!(registry.is_open(step));

        // A probe success after another wait clears everything.
        tokio::time::advance(Duration::from_millis(30_001)).await;
        registry.record_success(step);
        assert!(!registry.is_open(step));
        assert_eq!(registry.failures(step), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_independent() {
        let registry = make_registry();
        for _ in 0..3 {
            registry.record_failure(StepName::RiskSignals);
        }
        assert!(registry.is_open(StepName::RiskSignals));
        assert!(!registry.is_open(StepName::GetProfile));
    }
}
