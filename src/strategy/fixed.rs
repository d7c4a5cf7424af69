//! Constant-delay strategy.

use serde_json::{json, Value};

use crate::config::StrategyKind;
use crate::outcome::HedgeOutcome;

use super::{DelayDecision, HedgeStrategy};

/// Always hedge after the same configured delay. Stateless; `update` is a
/// no-op.
pub struct FixedDelay {
    delay_ms: u64,
}

impl FixedDelay {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl HedgeStrategy for FixedDelay {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fixed
    }

    fn calculate_delay(&self) -> DelayDecision {
        DelayDecision::Delay(self.delay_ms)
    }

    fn update(&self, _outcome: &HedgeOutcome) {}

    fn stats(&self) -> Value {
        json!({
            "strategy": "fixed",
            "delay_ms": self.delay_ms,
        })
    }

    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_delay() {
        let strategy = FixedDelay::new(75);
        assert_eq!(strategy.calculate_delay(), DelayDecision::Delay(75));
        // update changes nothing
        let mut outcome = HedgeOutcome::new(StrategyKind::Fixed, Some(75));
        outcome.hedged = true;
        strategy.update(&outcome);
        assert_eq!(strategy.calculate_delay(), DelayDecision::Delay(75));
        assert_eq!(strategy.stats()["delay_ms"], 75);
    }
}
