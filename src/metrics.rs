//! Aggregate metrics collection.
//!
//! [`MetricsSink`] keeps a bounded FIFO of latency samples plus counters for
//! hedging behavior, and serves [`AggregateStats`] snapshots on demand. The
//! pure [`percentile`] / [`percentiles`] helpers implement the nearest-rank
//! definition used everywhere in the engine: for a sorted sequence of length
//! `n`, the p-th percentile is the element at index `max(0, ceil(n·p/100) − 1)`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use crate::outcome::HedgeOutcome;

/// Default bound on the rolling latency window.
pub const DEFAULT_METRICS_WINDOW: usize = 10_000;

/// Nearest-rank p-th percentile of `values`. Returns 0 for an empty slice.
pub fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted[nearest_rank_index(sorted.len(), p)]
}

/// Nearest-rank percentiles for several `p` values over one sorted copy.
pub fn percentiles(values: &[u64], ps: &[f64]) -> Vec<u64> {
    if values.is_empty() {
        return vec![0; ps.len()];
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    ps.iter()
        .map(|&p| sorted[nearest_rank_index(sorted.len(), p)])
        .collect()
}

fn nearest_rank_index(n: usize, p: f64) -> usize {
    let rank = (n as f64 * p / 100.0).ceil() as isize - 1;
    rank.max(0) as usize
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Snapshot served by [`MetricsSink::get_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_requests: u64,
    pub sample_count: usize,
    /// `hedged / total`.
    pub hedge_rate: f64,
    /// `wins / hedged`.
    pub hedge_win_rate: f64,
    /// `wins / total`.
    pub hedge_effectiveness: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub median: u64,
    pub total_cost: f64,
    pub avg_cost: f64,
    /// `(total_cost − total) / total`, as a percentage rounded to 2 places.
    pub cost_overhead_pct: f64,
    pub uptime_ms: u64,
    /// Requests per second over the sink's lifetime.
    pub throughput_rps: f64,
}

struct SinkState {
    samples: VecDeque<u64>,
    total: u64,
    hedged: u64,
    hedge_wins: u64,
    sum_cost: f64,
    opened_at: Instant,
}

impl SinkState {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            total: 0,
            hedged: 0,
            hedge_wins: 0,
            sum_cost: 0.0,
            opened_at: Instant::now(),
        }
    }
}

/// Process-wide, serialized aggregate collector.
pub struct MetricsSink {
    window_size: usize,
    state: Mutex<SinkState>,
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_WINDOW)
    }
}

impl MetricsSink {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            state: Mutex::new(SinkState::new()),
        }
    }

    /// Fold one request outcome into the window and counters.
    pub fn record(&self, outcome: &HedgeOutcome) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        if state.samples.len() == self.window_size {
            state.samples.pop_front();
        }
        state.samples.push_back(outcome.total_latency);
        state.total += 1;
        if outcome.hedged {
            state.hedged += 1;
        }
        if outcome.hedge_won {
            state.hedge_wins += 1;
        }
        state.sum_cost += outcome.cost;
    }

    /// Current aggregate snapshot. Every ratio is guarded to 0.0 when its
    /// denominator is zero.
    pub fn get_stats(&self) -> AggregateStats {
        let state = self.state.lock().expect("metrics lock poisoned");
        let samples: Vec<u64> = state.samples.iter().copied().collect();
        let pcts = percentiles(&samples, &[50.0, 90.0, 95.0, 99.0, 99.9]);
        let sum: u64 = samples.iter().sum();
        let total = state.total as f64;
        let uptime_ms = state.opened_at.elapsed().as_millis() as u64;

        AggregateStats {
            total_requests: state.total,
            sample_count: samples.len(),
            hedge_rate: ratio(state.hedged as f64, total),
            hedge_win_rate: ratio(state.hedge_wins as f64, state.hedged as f64),
            hedge_effectiveness: ratio(state.hedge_wins as f64, total),
            p50: pcts[0],
            p90: pcts[1],
            p95: pcts[2],
            p99: pcts[3],
            p999: pcts[4],
            min: samples.iter().copied().min().unwrap_or(0),
            max: samples.iter().copied().max().unwrap_or(0),
            mean: ratio(sum as f64, samples.len() as f64),
            median: pcts[0],
            total_cost: state.sum_cost,
            avg_cost: ratio(state.sum_cost, total),
            cost_overhead_pct: round2(ratio(state.sum_cost - total, total) * 100.0),
            uptime_ms,
            throughput_rps: ratio(total * 1000.0, uptime_ms as f64),
        }
    }

    /// Drop all samples and counters and restart the uptime epoch.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("metrics lock poisoned");
        *state = SinkState::new();
    }
}
