//! Multi-tier cascade: ordered fallback across request functions.
//!
//! Each [`Tier`] is a labelled request function with its own escalation
//! delay, cost, and optional quality threshold. The cascade calls tier 0 and
//! waits up to its delay; on error or delay expiry the tier is left running
//! in the background and the next tier starts. The first `Ok` that satisfies
//! its tier's quality gate wins and cancels everything else. When no tier
//! wins outright, a short grace period lets background tiers land before the
//! final selection: first gate-passing `Ok` by list order, else the first
//! `Ok` ignoring gates, else `AllTiersFailed`.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HedgeConfig;
use crate::error::{HedgeError, Result};
use crate::executor::HedgeExecutor;
use crate::telemetry::{measure, suffix};

/// How long the final selection waits for background tiers, in ms.
const GRACE_MS: u64 = 100;

type TierFn = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<Value, BoxError>> + Send + Sync>;

/// One level of the cascade.
#[derive(Clone)]
pub struct Tier {
    pub name: String,
    /// How long to wait on this tier before escalating, in ms.
    pub delay_ms: u64,
    /// Currency cost charged when this tier's task starts.
    pub cost: f64,
    /// Minimum acceptable quality score in `[0, 1]`; absent means any `Ok`
    /// is acceptable.
    pub quality_threshold: Option<f64>,
    request_fn: TierFn,
}

impl Tier {
    pub fn new<F, Fut>(name: impl Into<String>, delay_ms: u64, request_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            delay_ms,
            cost: 0.0,
            quality_threshold: None,
            request_fn: Arc::new(move || Box::pin(request_fn())),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }
}

/// Metadata returned alongside the winning tier's value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierOutcome {
    /// Name of the tier whose result was returned.
    pub tier: String,
    /// Index of that tier in the input list.
    pub tier_index: usize,
    /// How many escalations had happened when the winner was chosen.
    pub hedges_fired: usize,
    /// Sum of the costs of every tier whose task was observed to start,
    /// including tasks still pending at selection.
    pub total_cost: f64,
    /// Elapsed ms from cascade entry to selection.
    pub total_latency: u64,
}

/// The quality gate: a result passes when it is not a structured object, or
/// its `confidence` (preferred) / `quality_score` meets the threshold. An
/// object with neither field scores 1.0, as does a non-numeric score field.
fn gate_passes(value: &Value, threshold: Option<f64>) -> bool {
    let Some(threshold) = threshold else {
        return true;
    };
    let Some(object) = value.as_object() else {
        return true;
    };
    let score = match object.get("confidence").or_else(|| object.get("quality_score")) {
        None => 1.0,
        Some(field) => match field.as_f64() {
            Some(score) => score,
            None => {
                warn!(field = %field, "non-numeric quality score, treating as 1.0");
                1.0
            }
        },
    };
    score >= threshold
}

struct TierReport {
    index: usize,
    started_at: u64,
    finished_at: u64,
    result: std::result::Result<Value, BoxError>,
}

impl HedgeExecutor {
    /// Run the multi-tier cascade. `config` supplies the overall deadline
    /// and telemetry prefix; `None` uses the defaults.
    pub async fn multi_tier(
        &self,
        tiers: Vec<Tier>,
        config: Option<&HedgeConfig>,
    ) -> Result<(Value, TierOutcome)> {
        let default_config = HedgeConfig::default();
        let config = config.unwrap_or(&default_config);
        if tiers.is_empty() {
            return Err(HedgeError::InvalidConfig {
                message: "multi_tier requires at least one tier".to_string(),
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let prefix = config.telemetry_prefix.as_str();
        let start = Instant::now();

        self.tier_event(
            prefix,
            suffix::MULTI_LEVEL_START,
            measure("system_time", chrono::Utc::now().timestamp_millis() as f64),
            &request_id,
            &[("tier_count", &tiers.len().to_string())],
        );

        let result = self.run_cascade(tiers, config, &request_id, start).await;
        let duration = start.elapsed().as_millis() as f64;

        match &result {
            Ok((_, outcome)) => {
                self.tier_event(
                    prefix,
                    suffix::MULTI_LEVEL_STOP,
                    measure("duration", duration),
                    &request_id,
                    &[
                        ("tier", &outcome.tier),
                        ("total_cost", &format!("{:.2}", outcome.total_cost)),
                    ],
                );
            }
            Err(error) => {
                self.tier_event(
                    prefix,
                    suffix::MULTI_LEVEL_EXCEPTION,
                    measure("duration", duration),
                    &request_id,
                    &[("error", &error.to_string())],
                );
            }
        }
        result
    }

    async fn run_cascade(
        &self,
        tiers: Vec<Tier>,
        config: &HedgeConfig,
        request_id: &str,
        start: Instant,
    ) -> Result<(Value, TierOutcome)> {
        let prefix = config.telemetry_prefix.as_str();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<TierReport>();

        let deadline = tokio::time::sleep(Duration::from_millis(config.timeout_ms));
        tokio::pin!(deadline);

        let mut results: Vec<Option<std::result::Result<Value, BoxError>>> =
            (0..tiers.len()).map(|_| None).collect();
        let mut fired = 0usize;
        let mut delivered = 0usize;
        let mut frontier = 0usize;

        self.spawn_tier(&tiers, 0, &token, start, &tx, request_id, prefix);
        fired += 1;
        let mut escalate_at = start + Duration::from_millis(tiers[0].delay_ms);

        // Escalation phase: walk down the tier list.
        loop {
            if fired == tiers.len() && delivered == fired {
                break;
            }
            tokio::select! {
                _ = &mut deadline => {
                    return self.select_final(
                        &tiers, &results, fired, &token, request_id, prefix, start,
                    );
                }

                _ = tokio::time::sleep_until(escalate_at) => {
                    if results[frontier].is_none() {
                        self.tier_event(
                            prefix,
                            suffix::TIER_TIMEOUT,
                            Default::default(),
                            request_id,
                            &[("tier", &tiers[frontier].name)],
                        );
                        debug!(tier = %tiers[frontier].name, "tier delay elapsed, escalating");
                    }
                    if frontier + 1 < tiers.len() {
                        frontier += 1;
                        self.spawn_tier(&tiers, frontier, &token, start, &tx, request_id, prefix);
                        fired += 1;
                        escalate_at = Instant::now() + Duration::from_millis(tiers[frontier].delay_ms);
                    } else {
                        break;
                    }
                }

                report = rx.recv() => {
                    let Some(report) = report else {
                        return Err(HedgeError::Internal {
                            message: "tier channel closed".to_string(),
                        });
                    };
                    delivered += 1;
                    let index = report.index;
                    self.tier_event(
                        prefix,
                        suffix::TIER_COMPLETED,
                        measure("duration", report.finished_at.saturating_sub(report.started_at) as f64),
                        request_id,
                        &[
                            ("tier", &tiers[index].name),
                            ("ok", &report.result.is_ok().to_string()),
                        ],
                    );

                    if let Ok(value) = &report.result {
                        if gate_passes(value, tiers[index].quality_threshold) {
                            let value = value.clone();
                            return Ok(self.finish_with(
                                value, index, &tiers, &results, fired, &token, request_id, prefix, start,
                            ));
                        }
                    }
                    results[index] = Some(report.result);

                    // The tier we were waiting on is done without winning;
                    // there is no point sitting out the rest of its delay.
                    if index == frontier {
                        if frontier + 1 < tiers.len() {
                            frontier += 1;
                            self.spawn_tier(&tiers, frontier, &token, start, &tx, request_id, prefix);
                            fired += 1;
                            escalate_at = Instant::now() + Duration::from_millis(tiers[frontier].delay_ms);
                        } else if delivered == fired {
                            break;
                        }
                    }
                }
            }
        }

        // Grace phase: give background tiers a moment to land.
        if delivered < fired {
            let grace_end = Instant::now() + Duration::from_millis(GRACE_MS);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tokio::time::sleep_until(grace_end) => break,
                    report = rx.recv() => {
                        let Some(report) = report else { break };
                        delivered += 1;
                        let index = report.index;
                        self.tier_event(
                            prefix,
                            suffix::TIER_COMPLETED,
                            measure("duration", report.finished_at.saturating_sub(report.started_at) as f64),
                            request_id,
                            &[
                                ("tier", &tiers[index].name),
                                ("ok", &report.result.is_ok().to_string()),
                            ],
                        );
                        if let Ok(value) = &report.result {
                            if gate_passes(value, tiers[index].quality_threshold) {
                                let value = value.clone();
                                return Ok(self.finish_with(
                                    value, index, &tiers, &results, fired, &token, request_id, prefix, start,
                                ));
                            }
                        }
                        results[index] = Some(report.result);
                        if delivered == fired {
                            break;
                        }
                    }
                }
            }
        }

        self.select_final(&tiers, &results, fired, &token, request_id, prefix, start)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_tier(
        &self,
        tiers: &[Tier],
        index: usize,
        token: &CancellationToken,
        start: Instant,
        tx: &mpsc::UnboundedSender<TierReport>,
        request_id: &str,
        prefix: &str,
    ) {
        let tier = &tiers[index];
        self.tier_event(
            prefix,
            suffix::TIER_START,
            Default::default(),
            request_id,
            &[("tier", &tier.name)],
        );
        debug!(tier = %tier.name, index, "tier started");

        let request_fn = tier.request_fn.clone();
        let tx = tx.clone();
        let cancelled = token.child_token();
        tokio::spawn(async move {
            let started_at = start.elapsed().as_millis() as u64;
            tokio::select! {
                _ = cancelled.cancelled() => {}
                result = request_fn() => {
                    let finished_at = start.elapsed().as_millis() as u64;
                    let _ = tx.send(TierReport { index, started_at, finished_at, result });
                }
            }
        });
    }

    /// Final selection once no tier won outright: first gate-passing `Ok` by
    /// list order, else the first `Ok` ignoring gates, else `AllTiersFailed`.
    #[allow(clippy::too_many_arguments)]
    fn select_final(
        &self,
        tiers: &[Tier],
        results: &[Option<std::result::Result<Value, BoxError>>],
        fired: usize,
        token: &CancellationToken,
        request_id: &str,
        prefix: &str,
        start: Instant,
    ) -> Result<(Value, TierOutcome)> {
        for (index, slot) in results.iter().enumerate() {
            if let Some(Ok(value)) = slot {
                if gate_passes(value, tiers[index].quality_threshold) {
                    let value = value.clone();
                    return Ok(self.finish_with(
                        value, index, tiers, results, fired, token, request_id, prefix, start,
                    ));
                }
            }
        }
        for (index, slot) in results.iter().enumerate() {
            if let Some(Ok(value)) = slot {
                let value = value.clone();
                return Ok(self.finish_with(
                    value, index, tiers, results, fired, token, request_id, prefix, start,
                ));
            }
        }

        token.cancel();
        Err(HedgeError::AllTiersFailed {
            tier_count: tiers.len(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_with(
        &self,
        value: Value,
        index: usize,
        tiers: &[Tier],
        results: &[Option<std::result::Result<Value, BoxError>>],
        fired: usize,
        token: &CancellationToken,
        request_id: &str,
        prefix: &str,
        start: Instant,
    ) -> (Value, TierOutcome) {
        token.cancel();
        for (i, tier) in tiers.iter().enumerate().take(fired) {
            if i != index && results[i].is_none() {
                self.tier_event(
                    prefix,
                    suffix::TIER_CANCELLED,
                    Default::default(),
                    request_id,
                    &[("tier", &tier.name)],
                );
            }
        }

        let outcome = TierOutcome {
            tier: tiers[index].name.clone(),
            tier_index: index,
            hedges_fired: index,
            total_cost: tiers.iter().take(fired).map(|t| t.cost).sum(),
            total_latency: start.elapsed().as_millis() as u64,
        };
        debug!(tier = %outcome.tier, cost = outcome.total_cost, "cascade selected tier");
        (value, outcome)
    }

    fn tier_event(
        &self,
        prefix: &str,
        event: &str,
        measurements: std::collections::HashMap<String, f64>,
        request_id: &str,
        extra: &[(&str, &str)],
    ) {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("request_id".to_string(), request_id.to_string());
        for (k, v) in extra {
            metadata.insert((*k).to_string(), (*v).to_string());
        }
        self.telemetry().emit(prefix, event, measurements, metadata);
    }
}
