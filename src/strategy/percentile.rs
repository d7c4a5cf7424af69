//! Rolling-percentile strategy.
//!
//! The form recommended in "The Tail at Scale": hedge when the primary has
//! been running longer than the p-th percentile of recently observed
//! latencies. The delay is recomputed only when samples arrive, so
//! `calculate_delay` is a cheap cached read.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;

use crate::config::{
    HedgeConfig, StrategyKind, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MIN_SAMPLES, DEFAULT_WINDOW_SIZE,
};
use crate::metrics::percentile;
use crate::outcome::HedgeOutcome;

use super::{DelayDecision, HedgeStrategy};

/// Resolved rolling-percentile parameters.
#[derive(Debug, Clone, Copy)]
pub struct PercentileParams {
    /// Target percentile, within `[50, 99]`.
    pub percentile: f64,
    /// FIFO window length.
    pub window_size: usize,
    /// Samples needed before the cached delay is recomputed.
    pub min_samples: usize,
    /// Delay used until enough samples arrive, in ms.
    pub initial_delay: u64,
}

impl PercentileParams {
    pub fn from_config(config: &HedgeConfig) -> Self {
        Self {
            percentile: config.percentile.unwrap_or(95.0),
            window_size: config.window_size.unwrap_or(DEFAULT_WINDOW_SIZE).max(1),
            min_samples: config.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES).max(1),
            initial_delay: config.initial_delay.unwrap_or(DEFAULT_INITIAL_DELAY_MS),
        }
    }
}

struct PercentileState {
    samples: VecDeque<u64>,
    current_delay: u64,
}

/// FIFO of recent latency samples plus a cached nearest-rank delay.
pub struct RollingPercentile {
    params: PercentileParams,
    state: Mutex<PercentileState>,
}

impl RollingPercentile {
    pub fn new(params: PercentileParams) -> Self {
        Self {
            state: Mutex::new(PercentileState {
                samples: VecDeque::with_capacity(params.window_size),
                current_delay: params.initial_delay,
            }),
            params,
        }
    }

    /// The latency signal an outcome contributes: the primary's latency,
    /// falling back to the backup's and then the whole call's.
    fn sample_of(outcome: &HedgeOutcome) -> u64 {
        outcome
            .primary_latency
            .or(outcome.backup_latency)
            .unwrap_or(outcome.total_latency)
    }
}

impl HedgeStrategy for RollingPercentile {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Percentile
    }

    fn calculate_delay(&self) -> DelayDecision {
        let state = self.state.lock().expect("percentile state poisoned");
        DelayDecision::Delay(state.current_delay)
    }

    fn update(&self, outcome: &HedgeOutcome) {
        let sample = Self::sample_of(outcome);
        let mut state = self.state.lock().expect("percentile state poisoned");
        if state.samples.len() == self.params.window_size {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);

        if state.samples.len() >= self.params.min_samples {
            let window: Vec<u64> = state.samples.iter().copied().collect();
            state.current_delay = percentile(&window, self.params.percentile);
            trace!(
                samples = window.len(),
                delay = state.current_delay,
                "recomputed percentile delay"
            );
        }
    }

    fn stats(&self) -> Value {
        let state = self.state.lock().expect("percentile state poisoned");
        json!({
            "strategy": "percentile",
            "percentile": self.params.percentile,
            "window_size": self.params.window_size,
            "min_samples": self.params.min_samples,
            "initial_delay": self.params.initial_delay,
            "sample_count": state.samples.len(),
            "current_delay": state.current_delay,
        })
    }

    fn reset(&self) {
        let mut state = self.state.lock().expect("percentile state poisoned");
        state.samples.clear();
        state.current_delay = self.params.initial_delay;
    }
}
