//! # tail-hedge
//!
//! Adaptive request hedging for tail-latency reduction, after Dean &
//! Barroso's "The Tail at Scale": when an idempotent remote call runs longer
//! than an adaptive delay, fire one or more concurrent backup attempts, take
//! the first success, and cancel the losers. A small fraction of duplicated
//! work buys large P99 reductions.
//!
//! ## Core Concepts
//!
//! - **[`HedgeExecutor`]**: the per-request orchestrator. It consults a
//!   strategy for the hedge delay, races primary and backups, cancels the
//!   losers, and emits structured outcome metadata.
//! - **Strategies**: pluggable delay-selection policies (fixed,
//!   rolling-percentile, a Thompson-sampling bandit, a workload-aware
//!   multiplier, and multiplicative AIMD backoff), registered by name in a
//!   [`StrategyRegistry`] so distinct backends keep distinct state.
//! - **Multi-tier cascade**: ordered fallback across [`Tier`]s, each with
//!   its own escalation delay, cost, and quality gate.
//! - **[`MetricsSink`]**: bounded rolling-window counters producing hedge
//!   rate, win rate, cost overhead, and latency percentiles.
//! - **[`TelemetryBus`]**: typed event stream (`request.start`,
//!   `hedge.fired`, `hedge.won`, ...) under a caller-chosen prefix.
//! - **[`HedgeLayer`]**: tower middleware for embedding the engine in a
//!   service stack.
//!
//! ## Getting Started
//!
//! ```rust
//! use tail_hedge::{HedgeConfig, StrategyKind};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HedgeConfig::builder()
//!     .strategy(StrategyKind::Fixed)
//!     .delay_ms(100)
//!     .timeout_ms(5_000)
//!     .build()?;
//!
//! let (value, outcome) = tail_hedge::request(
//!     || async {
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!         Ok::<_, tower::BoxError>("fast")
//!     },
//!     config,
//! )
//! .await?;
//!
//! assert_eq!(value, "fast");
//! assert!(!outcome.hedged); // the primary beat the 100ms hedge delay
//! # Ok(())
//! # }
//! ```
//!
//! The caller guarantees the request function is safe to invoke more than
//! once concurrently. Hedging is not a retry mechanism: a terminal failure
//! of the only in-flight attempt is returned as-is, never re-invoked.
//!
//! [`HedgeExecutor`]: crate::executor::HedgeExecutor
//! [`StrategyRegistry`]: crate::strategy::StrategyRegistry
//! [`Tier`]: crate::cascade::Tier
//! [`MetricsSink`]: crate::metrics::MetricsSink
//! [`TelemetryBus`]: crate::telemetry::TelemetryBus
//! [`HedgeLayer`]: crate::service::HedgeLayer

pub mod cascade;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod outcome;
pub mod service;
pub mod strategy;
pub mod telemetry;

// Re-export core types for convenience
pub use cascade::{Tier, TierOutcome};
pub use config::{HedgeConfig, HedgeConfigBuilder, StrategyKind};
pub use error::{HedgeError, Result};
pub use executor::{default_executor, HedgeExecutor};
pub use metrics::{percentile, percentiles, AggregateStats, MetricsSink};
pub use outcome::{AttemptRole, HedgeOutcome};
pub use service::{Hedge, HedgeLayer};
pub use strategy::{default_registry, DelayDecision, HedgeStrategy, StrategyRegistry};
pub use telemetry::{TelemetryBus, TelemetryEvent};

use serde_json::Value;

/// Run one hedged call through the process-wide default executor.
///
/// Prefer an explicit [`HedgeExecutor`] handle when you need isolated
/// strategy state, metrics, or telemetry.
pub async fn request<T, F, Fut>(f: F, config: HedgeConfig) -> Result<(T, HedgeOutcome)>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<T, tower::BoxError>> + Send + 'static,
{
    default_executor().request(f, &config).await
}

/// Run the multi-tier cascade through the process-wide default executor.
pub async fn multi_tier(
    tiers: Vec<Tier>,
    config: Option<HedgeConfig>,
) -> Result<(Value, TierOutcome)> {
    default_executor().multi_tier(tiers, config.as_ref()).await
}
