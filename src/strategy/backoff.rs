//! Multiplicative AIMD backoff strategy.
//!
//! The delay shrinks geometrically while hedges keep winning (the system is
//! slow, hedge sooner) and grows when hedges fire without winning or the
//! request errors (hedging is wasted or the backend is struggling). Both
//! directions are clamped to `[min_delay, max_delay]`.

use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::debug;

use crate::config::{HedgeConfig, StrategyKind};
use crate::outcome::HedgeOutcome;

use super::{DelayDecision, HedgeStrategy};

/// Resolved AIMD parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub base_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
    pub error_factor: f64,
}

impl BackoffParams {
    pub fn from_config(config: &HedgeConfig) -> Self {
        let (base, min, max, inc, dec, err) = config.exponential_params();
        Self {
            base_delay: base,
            min_delay: min,
            max_delay: max,
            increase_factor: inc,
            decrease_factor: dec,
            error_factor: err,
        }
    }
}

struct BackoffState {
    current_delay: f64,
    consecutive_successes: u64,
    consecutive_failures: u64,
    total_adjustments: u64,
}

/// AIMD delay controller.
pub struct ExpBackoff {
    params: BackoffParams,
    state: Mutex<BackoffState>,
}

impl ExpBackoff {
    pub fn new(params: BackoffParams) -> Self {
        Self {
            state: Mutex::new(BackoffState {
                current_delay: params.base_delay,
                consecutive_successes: 0,
                consecutive_failures: 0,
                total_adjustments: 0,
            }),
            params,
        }
    }
}

impl HedgeStrategy for ExpBackoff {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExpBackoff
    }

    fn calculate_delay(&self) -> DelayDecision {
        let state = self.state.lock().expect("backoff state poisoned");
        DelayDecision::Delay(state.current_delay.round() as u64)
    }

    fn update(&self, outcome: &HedgeOutcome) {
        let mut state = self.state.lock().expect("backoff state poisoned");
        let before = state.current_delay;

        if outcome.hedge_won {
            // The hedge paid off: hedge sooner next time.
            state.current_delay =
                (state.current_delay * self.params.decrease_factor).max(self.params.min_delay);
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        } else if outcome.hedged {
            // Fired a backup that lost: back off.
            state.current_delay =
                (state.current_delay * self.params.increase_factor).min(self.params.max_delay);
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        } else if outcome.is_error() {
            state.current_delay =
                (state.current_delay * self.params.error_factor).min(self.params.max_delay);
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
        } else {
            // Primary was fast enough that no backup fired.
            state.current_delay =
                (state.current_delay * self.params.decrease_factor).max(self.params.min_delay);
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
        }

        state.total_adjustments += 1;
        debug!(
            from = before,
            to = state.current_delay,
            "backoff delay adjusted"
        );
    }

    fn stats(&self) -> Value {
        let state = self.state.lock().expect("backoff state poisoned");
        json!({
            "strategy": "exp_backoff",
            "current_delay": state.current_delay,
            "base_delay": self.params.base_delay,
            "min_delay": self.params.min_delay,
            "max_delay": self.params.max_delay,
            "consecutive_successes": state.consecutive_successes,
            "consecutive_failures": state.consecutive_failures,
            "total_adjustments": state.total_adjustments,
        })
    }

    fn reset(&self) {
        let mut state = self.state.lock().expect("backoff state poisoned");
        state.current_delay = self.params.base_delay;
        state.consecutive_successes = 0;
        state.consecutive_failures = 0;
        state.total_adjustments = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BackoffParams {
        BackoffParams {
            base_delay: 100.0,
            min_delay: 10.0,
            max_delay: 5000.0,
            increase_factor: 1.5,
            decrease_factor: 0.9,
            error_factor: 2.0,
        }
    }

    fn won() -> HedgeOutcome {
        let mut o = HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100));
        o.hedged = true;
        o.hedge_won = true;
        o
    }

    fn lost() -> HedgeOutcome {
        let mut o = HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100));
        o.hedged = true;
        o
    }

    fn errored() -> HedgeOutcome {
        let mut o = HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100));
        o.error = Some("boom".to_string());
        o
    }

    fn fast_primary() -> HedgeOutcome {
        HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100))
    }

    fn current(strategy: &ExpBackoff) -> u64 {
        strategy.calculate_delay().as_millis().unwrap()
    }

    #[test]
    fn test_hedge_win_decreases() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&won());
        assert_eq!(current(&strategy), 90);
        strategy.update(&won());
        assert_eq!(current(&strategy), 81);
    }

    #[test]
    fn test_win_monotonicity_bottoms_at_min() {
        let strategy = ExpBackoff::new(params());
        let mut previous = current(&strategy);
        for _ in 0..100 {
            strategy.update(&won());
            let now = current(&strategy);
            assert!(now <= previous);
            previous = now;
        }
        assert_eq!(current(&strategy), 10);
    }

    #[test]
    fn test_error_monotonicity_tops_at_max() {
        let strategy = ExpBackoff::new(params());
        let mut previous = current(&strategy);
        for _ in 0..20 {
            strategy.update(&errored());
            let now = current(&strategy);
            assert!(now >= previous);
            previous = now;
        }
        assert_eq!(current(&strategy), 5000);
    }

    #[test]
    fn test_lost_hedge_increases() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&lost());
        assert_eq!(current(&strategy), 150);
    }

    #[test]
    fn test_fast_primary_counts_as_success() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&fast_primary());
        assert_eq!(current(&strategy), 90);
        assert_eq!(strategy.stats()["consecutive_successes"], 1);
    }

    #[test]
    fn test_streak_counters() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&won());
        strategy.update(&won());
        assert_eq!(strategy.stats()["consecutive_successes"], 2);
        assert_eq!(strategy.stats()["consecutive_failures"], 0);

        strategy.update(&lost());
        assert_eq!(strategy.stats()["consecutive_successes"], 0);
        assert_eq!(strategy.stats()["consecutive_failures"], 1);
        assert_eq!(strategy.stats()["total_adjustments"], 3);
    }

    #[test]
    fn test_every_branch_counts_an_adjustment() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&won());
        strategy.update(&lost());
        strategy.update(&errored());
        strategy.update(&fast_primary());
        assert_eq!(strategy.stats()["total_adjustments"], 4);
    }

    #[test]
    fn test_reset() {
        let strategy = ExpBackoff::new(params());
        strategy.update(&errored());
        strategy.update(&errored());
        strategy.reset();
        assert_eq!(current(&strategy), 100);
        assert_eq!(strategy.stats()["total_adjustments"], 0);
    }
}
