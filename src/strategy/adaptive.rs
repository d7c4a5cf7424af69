//! Thompson-sampling bandit over candidate delays.
//!
//! Each candidate delay is an arm with Beta(α, β) posterior parameters.
//! Selection samples a score per arm and plays the maximum; learning maps a
//! request outcome to a reward in `[0, 1]` and folds it into the played
//! arm's posterior. The sampler is a mean-plus-noise proxy whose exploration
//! shrinks as `1/√(α+β)`, i.e. with accumulated evidence.

use rand::Rng;
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::trace;

use crate::config::{HedgeConfig, StrategyKind, DEFAULT_DELAY_CANDIDATES};
use crate::outcome::HedgeOutcome;

use super::{DelayDecision, HedgeStrategy};

/// Latency saved by a winning hedge is scaled by this many ms to a reward
/// of 1.0.
const REWARD_SCALE_MS: f64 = 500.0;

/// An unhedged request faster than this is a strong signal the current
/// delay is well placed.
const FAST_REQUEST_MS: u64 = 200;

struct Arm {
    delay: u64,
    alpha: f64,
    beta: f64,
    pulls: u64,
    reward_sum: f64,
}

impl Arm {
    fn new(delay: u64) -> Self {
        Self {
            delay,
            alpha: 1.0,
            beta: 1.0,
            pulls: 0,
            reward_sum: 0.0,
        }
    }

    fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

struct BanditState {
    arms: Vec<Arm>,
    total_pulls: u64,
    total_reward: f64,
}

/// Thompson-sampling delay selector.
pub struct AdaptiveThompson {
    learning_rate: f64,
    state: Mutex<BanditState>,
}

impl AdaptiveThompson {
    pub fn new(candidates: Vec<u64>, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            state: Mutex::new(BanditState {
                arms: candidates.into_iter().map(Arm::new).collect(),
                total_pulls: 0,
                total_reward: 0.0,
            }),
        }
    }

    pub fn from_config(config: &HedgeConfig) -> Self {
        let candidates = config
            .delay_candidates
            .clone()
            .unwrap_or_else(|| DEFAULT_DELAY_CANDIDATES.to_vec());
        Self::new(candidates, config.learning_rate.unwrap_or(1.0))
    }

    /// Reward shaping: how good was the chosen delay for this request?
    fn reward(outcome: &HedgeOutcome) -> f64 {
        if outcome.is_error() {
            return 0.0;
        }
        if outcome.hedge_won {
            // Latency the hedge saved, relative to letting the primary run.
            let primary = outcome.primary_latency.unwrap_or(outcome.total_latency) as f64;
            let hedge_path = outcome.hedge_delay.unwrap_or(0) as f64
                + outcome.backup_latency.unwrap_or(0) as f64;
            return ((primary - hedge_path) / REWARD_SCALE_MS).clamp(0.0, 1.0);
        }
        if outcome.hedged {
            // Fired a backup that lost: pure overhead.
            return 0.0;
        }
        if outcome.total_latency < FAST_REQUEST_MS {
            0.8
        } else {
            0.5
        }
    }
}

impl HedgeStrategy for AdaptiveThompson {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Adaptive
    }

    fn calculate_delay(&self) -> DelayDecision {
        let mut state = self.state.lock().expect("bandit state poisoned");
        let mut rng = rand::thread_rng();

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, arm) in state.arms.iter().enumerate() {
            let exploration = 1.0 / (arm.alpha + arm.beta).sqrt();
            let score = arm.mean() + rng.gen_range(-0.5..0.5) * exploration;
            if score > best_score {
                best_score = score;
                best = i;
            }
        }

        state.arms[best].pulls += 1;
        state.total_pulls += 1;
        let delay = state.arms[best].delay;
        trace!(delay, score = best_score, "bandit picked arm");
        DelayDecision::Delay(delay)
    }

    fn update(&self, outcome: &HedgeOutcome) {
        let Some(played) = outcome.hedge_delay else {
            return;
        };
        let reward = Self::reward(outcome);
        let mut state = self.state.lock().expect("bandit state poisoned");
        // Delays not among the candidates carry no signal for any arm.
        let Some(arm) = state.arms.iter_mut().find(|a| a.delay == played) else {
            return;
        };
        arm.alpha += self.learning_rate * reward;
        arm.beta += self.learning_rate * (1.0 - reward);
        arm.reward_sum += reward;
        state.total_reward += reward;
    }

    fn stats(&self) -> Value {
        let state = self.state.lock().expect("bandit state poisoned");
        let arms: Vec<Value> = state
            .arms
            .iter()
            .map(|arm| {
                json!({
                    "delay": arm.delay,
                    "alpha": arm.alpha,
                    "beta": arm.beta,
                    "pulls": arm.pulls,
                    "reward_sum": arm.reward_sum,
                    "mean": arm.mean(),
                })
            })
            .collect();
        json!({
            "strategy": "adaptive",
            "arms": arms,
            "total_pulls": state.total_pulls,
            "total_reward": state.total_reward,
        })
    }

    fn reset(&self) {
        let mut state = self.state.lock().expect("bandit state poisoned");
        for arm in &mut state.arms {
            arm.alpha = 1.0;
            arm.beta = 1.0;
            arm.pulls = 0;
            arm.reward_sum = 0.0;
        }
        state.total_pulls = 0;
        state.total_reward = 0.0;
    }
}
