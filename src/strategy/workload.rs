//! Workload-aware multiplier strategy.
//!
//! Scales a base delay by independent per-dimension factors: longer prompts
//! and complex models earn a longer wait, peak hours and high priority a
//! shorter one. Stateless; tags come from the request configuration, so a
//! fresh instance is built per call.

use serde_json::{json, Value};

use crate::config::{HedgeConfig, StrategyKind, DEFAULT_BASE_DELAY_MS};
use crate::outcome::HedgeOutcome;

use super::{DelayDecision, HedgeStrategy};

/// Delays never drop below this, in ms.
const MIN_DELAY_MS: u64 = 10;

/// Per-request workload tags. Unknown or missing tags contribute a 1.0
/// factor.
#[derive(Debug, Clone, Default)]
pub struct WorkloadTags {
    pub prompt_length: Option<u64>,
    pub model_complexity: Option<String>,
    pub time_of_day: Option<String>,
    pub priority: Option<String>,
}

impl WorkloadTags {
    fn prompt_factor(&self) -> f64 {
        match self.prompt_length {
            Some(n) if n > 4000 => 2.5,
            Some(n) if n > 2000 => 2.0,
            Some(n) if n > 1000 => 1.5,
            _ => 1.0,
        }
    }

    fn complexity_factor(&self) -> f64 {
        match self.model_complexity.as_deref() {
            Some("simple") => 0.5,
            Some("complex") => 2.0,
            _ => 1.0,
        }
    }

    fn time_factor(&self) -> f64 {
        match self.time_of_day.as_deref() {
            Some("peak") => 0.7,
            Some("off_peak") => 1.3,
            _ => 1.0,
        }
    }

    fn priority_factor(&self) -> f64 {
        match self.priority.as_deref() {
            Some("high") => 0.6,
            Some("low") => 1.5,
            _ => 1.0,
        }
    }

    fn multiplier(&self) -> f64 {
        self.prompt_factor() * self.complexity_factor() * self.time_factor() * self.priority_factor()
    }
}

/// Stateless multiplier over workload tags.
pub struct WorkloadAware {
    base_delay: u64,
    tags: WorkloadTags,
}

impl WorkloadAware {
    pub fn new(base_delay: u64, tags: WorkloadTags) -> Self {
        Self { base_delay, tags }
    }

    pub fn from_config(config: &HedgeConfig) -> Self {
        Self::new(
            config.base_delay.unwrap_or(DEFAULT_BASE_DELAY_MS),
            WorkloadTags {
                prompt_length: config.prompt_length,
                model_complexity: config.model_complexity.clone(),
                time_of_day: config.time_of_day.clone(),
                priority: config.priority.clone(),
            },
        )
    }
}

impl HedgeStrategy for WorkloadAware {
    fn kind(&self) -> StrategyKind {
        StrategyKind::WorkloadAware
    }

    fn calculate_delay(&self) -> DelayDecision {
        let scaled = (self.base_delay as f64 * self.tags.multiplier()).round() as u64;
        DelayDecision::Delay(scaled.max(MIN_DELAY_MS))
    }

    fn update(&self, _outcome: &HedgeOutcome) {}

    fn stats(&self) -> Value {
        json!({
            "strategy": "workload_aware",
            "base_delay": self.base_delay,
            "multiplier": self.tags.multiplier(),
            "prompt_factor": self.tags.prompt_factor(),
            "complexity_factor": self.tags.complexity_factor(),
            "time_factor": self.tags.time_factor(),
            "priority_factor": self.tags.priority_factor(),
        })
    }

    fn reset(&self) {}
}
