//! Delay-selection strategies.
//!
//! A strategy answers two questions: "how long should this request wait on
//! the primary before firing a backup?" ([`HedgeStrategy::calculate_delay`])
//! and "what should be learned from this outcome?"
//! ([`HedgeStrategy::update`]). State lives in a small typed struct behind an
//! exclusive lock; reads are point-in-time snapshots, so all mutation is
//! linearisable without exposing the state itself.
//!
//! Stateful strategies (percentile, adaptive, exp-backoff) are registered in
//! a [`StrategyRegistry`] keyed by instance name and lazily created from the
//! first call's options. Stateless strategies (fixed, workload-aware, off)
//! are constructed per call, since their tags vary per request.

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{HedgeConfig, StrategyKind};
use crate::error::Result;
use crate::outcome::HedgeOutcome;

mod adaptive;
mod backoff;
mod fixed;
mod percentile;
mod workload;

pub use adaptive::AdaptiveThompson;
pub use backoff::{BackoffParams, ExpBackoff};
pub use fixed::FixedDelay;
pub use percentile::{PercentileParams, RollingPercentile};
pub use workload::{WorkloadAware, WorkloadTags};

/// What the strategy decided for the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayDecision {
    /// Wait this many milliseconds on the primary before escalating.
    Delay(u64),
    /// Never hedge; await the primary to completion or deadline.
    NoHedge,
}

impl DelayDecision {
    pub fn as_millis(&self) -> Option<u64> {
        match self {
            DelayDecision::Delay(ms) => Some(*ms),
            DelayDecision::NoHedge => None,
        }
    }
}

/// A stateful delay-selection policy.
///
/// Implementations must be safe under many concurrent `update`s and
/// `calculate_delay`s; all built-in strategies serialise through an internal
/// mutex with short critical sections.
pub trait HedgeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// The delay the next request should wait before firing a backup.
    fn calculate_delay(&self) -> DelayDecision;

    /// Learn from a completed request. Called exactly once per executor
    /// call, on success and error paths alike.
    fn update(&self, outcome: &HedgeOutcome);

    /// Point-in-time snapshot of the strategy's state as a JSON map.
    fn stats(&self) -> Value;

    /// Restore the initial state.
    fn reset(&self);
}

/// Degenerate strategy: hedging disabled.
pub struct Off;

impl HedgeStrategy for Off {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Off
    }

    fn calculate_delay(&self) -> DelayDecision {
        DelayDecision::NoHedge
    }

    fn update(&self, _outcome: &HedgeOutcome) {}

    fn stats(&self) -> Value {
        json!({ "strategy": "off" })
    }

    fn reset(&self) {}
}

/// Named strategy instances, lazily created on first use.
#[derive(Default)]
pub struct StrategyRegistry {
    inner: Mutex<HashMap<String, Arc<dyn HedgeStrategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a strategy instance from a validated configuration.
    pub fn build(config: &HedgeConfig) -> Result<Arc<dyn HedgeStrategy>> {
        config.validate()?;
        Ok(match config.strategy {
            StrategyKind::Fixed => Arc::new(FixedDelay::new(
                config.delay_ms.expect("validated fixed delay"),
            )),
            StrategyKind::Percentile => {
                Arc::new(RollingPercentile::new(PercentileParams::from_config(config)))
            }
            StrategyKind::Adaptive => Arc::new(AdaptiveThompson::from_config(config)),
            StrategyKind::WorkloadAware => Arc::new(WorkloadAware::from_config(config)),
            StrategyKind::ExpBackoff => {
                Arc::new(ExpBackoff::new(BackoffParams::from_config(config)))
            }
            StrategyKind::Off => Arc::new(Off),
        })
    }

    /// Register `name`, creating the instance from `config` on first use.
    /// Idempotent: an existing instance wins and keeps its state.
    pub fn start(&self, name: &str, config: &HedgeConfig) -> Result<Arc<dyn HedgeStrategy>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let built = Self::build(config)?;
        let mut inner = self.inner.lock().expect("strategy registry poisoned");
        // A concurrent starter may have won the race; keep the first.
        let instance = inner.entry(name.to_string()).or_insert(built).clone();
        debug!(name, strategy = %instance.kind(), "strategy instance ready");
        Ok(instance)
    }

    /// The instance registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<dyn HedgeStrategy>> {
        self.inner
            .lock()
            .expect("strategy registry poisoned")
            .get(name)
            .cloned()
    }

    /// Stats map for `name`, or `None` when that instance was never started.
    pub fn stats(&self, name: &str) -> Option<Value> {
        self.get(name).map(|s| s.stats())
    }

    /// Reset `name` to its initial state. Returns false when never started.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(strategy) => {
                strategy.reset();
                true
            }
            None => false,
        }
    }

    /// Locate or create the instance a request configuration refers to.
    ///
    /// Stateful kinds are keyed by [`HedgeConfig::effective_strategy_name`];
    /// stateless kinds are built fresh so per-request tags apply.
    pub fn resolve(&self, config: &HedgeConfig) -> Result<Arc<dyn HedgeStrategy>> {
        if config.strategy.is_stateful() {
            self.start(&config.effective_strategy_name(), config)
        } else {
            Self::build(config)
        }
    }

    /// Names of all registered instances.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("strategy registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

static DEFAULT_REGISTRY: Lazy<Arc<StrategyRegistry>> =
    Lazy::new(|| Arc::new(StrategyRegistry::new()));

/// The process-wide registry used by the top-level convenience API.
pub fn default_registry() -> Arc<StrategyRegistry> {
    DEFAULT_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HedgeConfig;

    fn backoff_config(name: &str) -> HedgeConfig {
        HedgeConfig {
            strategy: StrategyKind::ExpBackoff,
            strategy_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_off_never_hedges() {
        let off = Off;
        assert_eq!(off.calculate_delay(), DelayDecision::NoHedge);
        assert_eq!(off.calculate_delay().as_millis(), None);
        assert_eq!(off.stats()["strategy"], "off");
    }

    #[test]
    fn test_start_is_idempotent() {
        let registry = StrategyRegistry::new();
        let config = backoff_config("backend-a");
        let first = registry.start("backend-a", &config).unwrap();

        // Feed an outcome so the instance has visible state.
        let mut outcome = HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100));
        outcome.hedged = true;
        first.update(&outcome);

        let second = registry.start("backend-a", &config).unwrap();
        assert_eq!(
            first.stats()["total_adjustments"],
            second.stats()["total_adjustments"]
        );
        assert_eq!(registry.names(), vec!["backend-a".to_string()]);
    }

    #[test]
    fn test_resolve_keys_stateful_instances_by_name() {
        let registry = StrategyRegistry::new();
        let a = registry.resolve(&backoff_config("a")).unwrap();
        let b = registry.resolve(&backoff_config("b")).unwrap();
        let a_again = registry.resolve(&backoff_config("a")).unwrap();

        let mut outcome = HedgeOutcome::new(StrategyKind::ExpBackoff, Some(100));
        outcome.hedged = true;
        a.update(&outcome);

        assert_eq!(a.stats()["total_adjustments"], a_again.stats()["total_adjustments"]);
        assert_eq!(b.stats()["total_adjustments"], 0);
    }

    #[test]
    fn test_resolve_builds_stateless_fresh() {
        let registry = StrategyRegistry::new();
        let config = HedgeConfig {
            strategy: StrategyKind::Fixed,
            delay_ms: Some(25),
            ..Default::default()
        };
        let strategy = registry.resolve(&config).unwrap();
        assert_eq!(strategy.calculate_delay(), DelayDecision::Delay(25));
        // Nothing was registered.
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_resolve_rejects_invalid_config() {
        let registry = StrategyRegistry::new();
        let config = HedgeConfig {
            strategy: StrategyKind::Fixed,
            ..Default::default()
        };
        assert!(registry.resolve(&config).is_err());
    }

    #[test]
    fn test_stats_and_reset_lifecycle() {
        let registry = StrategyRegistry::new();
        assert!(registry.stats("missing").is_none());
        assert!(!registry.reset("missing"));

        registry.start("backend", &backoff_config("backend")).unwrap();
        assert!(registry.stats("backend").is_some());
        assert!(registry.reset("backend"));
    }
}
