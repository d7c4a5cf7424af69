//! Hedging executor.
//!
//! [`HedgeExecutor::request`] runs one hedged call: it consults the strategy
//! for a delay, spawns the primary attempt, fires staggered backups when the
//! primary overruns the delay, races all attempts to the first success,
//! cancels the losers, emits telemetry, and feeds the outcome back to the
//! strategy and the metrics sink.
//!
//! Attempts run in their own tokio tasks and report over an mpsc channel.
//! Each report carries a process-wide completion rank fetched atomically the
//! instant the attempt writes its result; the winner is the earliest `Ok`
//! ordered by `(finished_at, rank)`, which keeps the race deterministic even
//! when the millisecond clock cannot separate two finishers.

use futures::FutureExt;
use once_cell::sync::Lazy;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
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
use crate::metrics::MetricsSink;
use crate::outcome::{AttemptRole, HedgeOutcome};
use crate::strategy::{default_registry, DelayDecision, StrategyRegistry};
use crate::telemetry::{measure, suffix, TelemetryBus};

/// Process-wide completion ranks. Strictly monotonic; the authoritative
/// tiebreaker when two attempts finish in the same millisecond.
static COMPLETION_RANK: AtomicU64 = AtomicU64::new(0);

/// Geometric stagger ratio between additional backups.
const BACKUP_STAGGER: f64 = 1.5;

enum AttemptOutcome<T> {
    Ok(T),
    Err(BoxError),
    Cancelled,
}

struct AttemptReport<T> {
    role: AttemptRole,
    started_at: u64,
    finished_at: u64,
    rank: u64,
    outcome: AttemptOutcome<T>,
}

impl<T> AttemptReport<T> {
    fn latency(&self) -> u64 {
        self.finished_at.saturating_sub(self.started_at)
    }

    fn is_ok(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Ok(_))
    }
}

/// Per-request orchestrator plus the shared collaborators it writes to.
pub struct HedgeExecutor {
    registry: Arc<StrategyRegistry>,
    metrics: Arc<MetricsSink>,
    telemetry: Arc<TelemetryBus>,
}

impl Default for HedgeExecutor {
    fn default() -> Self {
        Self::new(
            Arc::new(StrategyRegistry::new()),
            Arc::new(MetricsSink::default()),
            Arc::new(TelemetryBus::new()),
        )
    }
}

impl HedgeExecutor {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        metrics: Arc<MetricsSink>,
        telemetry: Arc<TelemetryBus>,
    ) -> Self {
        Self {
            registry,
            metrics,
            telemetry,
        }
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBus> {
        &self.telemetry
    }

    /// Run one hedged call of a zero-argument request function.
    ///
    /// `f` must be safe to invoke more than once concurrently; each attempt
    /// re-invokes it freshly. The returned metadata describes what the
    /// engine did even when no backup ever fired.
    pub async fn request<T, F, Fut>(&self, f: F, config: &HedgeConfig) -> Result<(T, HedgeOutcome)>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        self.request_with_token(move |_token| f(), config).await
    }

    /// Like [`HedgeExecutor::request`], but threads each attempt's child
    /// [`CancellationToken`] into `f` so cancellation-aware callers can
    /// release resources promptly instead of running to completion in the
    /// background.
    pub async fn request_with_token<T, F, Fut>(
        &self,
        f: F,
        config: &HedgeConfig,
    ) -> Result<(T, HedgeOutcome)>
    where
        T: Send + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        config.validate()?;
        let strategy = self.registry.resolve(config)?;
        let decision = strategy.calculate_delay();
        let request_id = Uuid::new_v4().to_string();
        let prefix = config.telemetry_prefix.as_str();
        let start = Instant::now();

        self.emit(
            prefix,
            suffix::REQUEST_START,
            measure("system_time", chrono::Utc::now().timestamp_millis() as f64),
            &request_id,
            &[("strategy", config.strategy.as_str())],
        );

        let (result, mut outcome) = self
            .race(Arc::new(f), config, decision, &request_id, start)
            .await;
        outcome.total_latency = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => {
                let mut metadata = outcome.metadata_map();
                metadata.insert("request_id".to_string(), request_id.clone());
                self.telemetry.emit(
                    prefix,
                    suffix::REQUEST_STOP,
                    measure("duration", outcome.total_latency as f64),
                    metadata,
                );
            }
            Err(error) => {
                outcome.error = Some(error_tag(error));
                self.emit(
                    prefix,
                    suffix::REQUEST_EXCEPTION,
                    measure("duration", outcome.total_latency as f64),
                    &request_id,
                    &[("error", &error.to_string())],
                );
            }
        }

        // Exactly once per executor call, success and error paths alike. A
        // panicking strategy must not damage an already-decided request.
        let feedback = outcome.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| strategy.update(&feedback))).is_err() {
            warn!(%request_id, strategy = %config.strategy, "strategy update panicked");
        }
        self.metrics.record(&outcome);

        result.map(|value| (value, outcome))
    }

    #[allow(clippy::too_many_lines)]
    async fn race<T, F, Fut>(
        &self,
        f: Arc<F>,
        config: &HedgeConfig,
        decision: DelayDecision,
        request_id: &str,
        start: Instant,
    ) -> (Result<T>, HedgeOutcome)
    where
        T: Send + 'static,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        let mut outcome = HedgeOutcome::new(config.strategy, decision.as_millis());
        let prefix = config.telemetry_prefix.as_str();
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<AttemptReport<T>>();

        let deadline = tokio::time::sleep(Duration::from_millis(config.timeout_ms));
        tokio::pin!(deadline);

        spawn_attempt(f.clone(), AttemptRole::Primary, &token, start, tx.clone());
        let mut spawned: Vec<AttemptRole> = vec![AttemptRole::Primary];

        // Backup 1 fires at the hedge timer; backup k at d·1.5^(k−1) past it.
        let hedge_timer_at = decision.as_millis().map(|d| start + Duration::from_millis(d));
        let mut next_backup_at = hedge_timer_at;
        let mut backups_fired = 0usize;

        let mut completed: Vec<AttemptReport<T>> = Vec::new();

        loop {
            let fire_at = next_backup_at;
            let backup_sleep = async move {
                match fire_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut deadline => {
                    // Attempts may have delivered in the same poll; prefer a
                    // real winner over a photo-finish timeout.
                    while let Ok(report) = rx.try_recv() {
                        completed.push(report);
                    }
                    if let Some(value) = self.try_pick_winner(
                        &mut completed, &mut outcome, config, request_id, &token, &spawned,
                    ) {
                        return (Ok(value), outcome);
                    }
                    token.cancel();
                    self.emit_cancellations(prefix, request_id, &spawned, &completed);
                    debug!(request_id, spawned = spawned.len(), "hedged request timed out");
                    return (
                        Err(HedgeError::Timeout {
                            attempt_count: spawned.len(),
                            elapsed_ms: start.elapsed().as_millis() as u64,
                        }),
                        outcome,
                    );
                }

                _ = backup_sleep, if next_backup_at.is_some() => {
                    backups_fired += 1;
                    let role = AttemptRole::Backup(backups_fired);
                    spawn_attempt(f.clone(), role, &token, start, tx.clone());
                    spawned.push(role);
                    outcome.hedged = true;
                    outcome.cost = 1.0 + backups_fired as f64;

                    let offset_ms = next_backup_at
                        .map(|at| at.saturating_duration_since(start).as_millis() as f64)
                        .unwrap_or(0.0);
                    self.emit(prefix, suffix::HEDGE_FIRED, measure("delay", offset_ms), request_id, &[]);
                    debug!(request_id, backup = backups_fired, offset_ms, "hedge fired");

                    next_backup_at = if backups_fired < config.max_hedges {
                        let base = decision.as_millis().unwrap_or(0) as f64;
                        let stagger = base * BACKUP_STAGGER.powi(backups_fired as i32);
                        hedge_timer_at.map(|at| at + Duration::from_millis(stagger.round() as u64))
                    } else {
                        None
                    };
                }

                report = rx.recv() => {
                    let Some(report) = report else {
                        // All senders dropped without a report; nothing can
                        // ever complete this request.
                        return (
                            Err(HedgeError::Internal {
                                message: "attempt channel closed".to_string(),
                            }),
                            outcome,
                        );
                    };
                    completed.push(report);
                    while let Ok(extra) = rx.try_recv() {
                        completed.push(extra);
                    }

                    if let Some(value) = self.try_pick_winner(
                        &mut completed, &mut outcome, config, request_id, &token, &spawned,
                    ) {
                        return (Ok(value), outcome);
                    }

                    // Fail fast: a primary error before any backup fired is
                    // terminal. Hedging masks latency, not deterministic
                    // failures.
                    if backups_fired == 0 {
                        if let Some(idx) = completed
                            .iter()
                            .position(|r| matches!(r.outcome, AttemptOutcome::Err(_)))
                        {
                            fold_latencies(&mut outcome, &completed);
                            let report = completed.swap_remove(idx);
                            let AttemptOutcome::Err(cause) = report.outcome else {
                                unreachable!("position matched an error report");
                            };
                            token.cancel();
                            return (
                                Err(HedgeError::RequestFailed {
                                    cause,
                                    attempt_count: spawned.len(),
                                    elapsed_ms: start.elapsed().as_millis() as u64,
                                }),
                                outcome,
                            );
                        }
                    }

                    // Every in-flight attempt has terminally failed: firing
                    // the remaining scheduled backups would be a retry, which
                    // this engine never does.
                    if completed.len() == spawned.len() {
                        fold_latencies(&mut outcome, &completed);
                        let cause = take_first_error(&mut completed)
                            .unwrap_or_else(|| "all attempts cancelled".into());
                        token.cancel();
                        return (
                            Err(HedgeError::AllAttemptsFailed {
                                cause,
                                attempt_count: spawned.len(),
                                elapsed_ms: start.elapsed().as_millis() as u64,
                            }),
                            outcome,
                        );
                    }
                }
            }
        }
    }

    /// Pick the earliest Ok by `(finished_at, rank)` if one exists, folding
    /// every delivered report into the outcome and cancelling the losers.
    fn try_pick_winner<T>(
        &self,
        completed: &mut Vec<AttemptReport<T>>,
        outcome: &mut HedgeOutcome,
        config: &HedgeConfig,
        request_id: &str,
        token: &CancellationToken,
        spawned: &[AttemptRole],
    ) -> Option<T> {
        let winner_idx = completed
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_ok())
            .min_by_key(|(_, r)| (r.finished_at, r.rank))
            .map(|(i, _)| i)?;

        fold_latencies(outcome, completed);
        let winner = completed.swap_remove(winner_idx);
        let winner_role = winner.role;
        let prefix = config.telemetry_prefix.as_str();

        outcome.hedge_won = winner.role.is_backup();
        match winner.role {
            AttemptRole::Primary => outcome.primary_latency = Some(winner.latency()),
            AttemptRole::Backup(_) => outcome.backup_latency = Some(winner.latency()),
        }

        if outcome.hedge_won {
            self.emit(
                prefix,
                suffix::HEDGE_WON,
                measure("latency", winner.latency() as f64),
                request_id,
                &[],
            );
            debug!(request_id, winner = %winner.role, "backup won the race");
        }

        if config.enable_cancellation {
            token.cancel();
            let losers: Vec<AttemptRole> = spawned
                .iter()
                .copied()
                .filter(|role| *role != winner_role)
                .collect();
            self.emit_cancellations(prefix, request_id, &losers, completed);
        }

        let AttemptOutcome::Ok(value) = winner.outcome else {
            unreachable!("winner index filtered on Ok");
        };
        Some(value)
    }

    /// One `request.cancelled` per attempt that was spawned but had not
    /// delivered an outcome when the cancellation signal went out.
    fn emit_cancellations<T>(
        &self,
        prefix: &str,
        request_id: &str,
        spawned: &[AttemptRole],
        completed: &[AttemptReport<T>],
    ) {
        for role in spawned {
            if !completed.iter().any(|r| r.role == *role) {
                self.emit(
                    prefix,
                    suffix::REQUEST_CANCELLED,
                    Default::default(),
                    request_id,
                    &[("attempt", &role.to_string())],
                );
            }
        }
    }

    fn emit(
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
        self.telemetry.emit(prefix, event, measurements, metadata);
    }
}

/// Spawn one attempt task. The task races the user future against its child
/// cancellation token, stamps the report with a completion rank the instant
/// the result is known, and delivers it over the channel. Panics inside the
/// attempt are contained and reported as errors.
fn spawn_attempt<T, F, Fut>(
    f: Arc<F>,
    role: AttemptRole,
    token: &CancellationToken,
    start: Instant,
    tx: mpsc::UnboundedSender<AttemptReport<T>>,
) where
    T: Send + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
{
    let child = token.child_token();
    tokio::spawn(async move {
        let started_at = start.elapsed().as_millis() as u64;
        let attempt_token = child.clone();
        let outcome = tokio::select! {
            _ = child.cancelled() => AttemptOutcome::Cancelled,
            result = AssertUnwindSafe(async move { f(attempt_token).await }).catch_unwind() => {
                match result {
                    Ok(Ok(value)) => AttemptOutcome::Ok(value),
                    Ok(Err(error)) => AttemptOutcome::Err(error),
                    Err(_) => AttemptOutcome::Err("attempt crashed".into()),
                }
            }
        };
        let finished_at = start.elapsed().as_millis() as u64;
        let rank = COMPLETION_RANK.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(AttemptReport {
            role,
            started_at,
            finished_at,
            rank,
            outcome,
        });
    });
}

/// Fold latencies from every delivered report: the primary's terminal
/// latency, and the first backup's as a fallback until a winner overwrites
/// it. Outcomes delivered after the race was decided still land here, so
/// they contribute to the learning signal.
fn fold_latencies<T>(outcome: &mut HedgeOutcome, completed: &[AttemptReport<T>]) {
    for report in completed {
        if matches!(report.outcome, AttemptOutcome::Cancelled) {
            continue;
        }
        match report.role {
            AttemptRole::Primary => outcome.primary_latency = Some(report.latency()),
            AttemptRole::Backup(_) => {
                if outcome.backup_latency.is_none() {
                    outcome.backup_latency = Some(report.latency());
                }
            }
        }
    }
}

/// The error of the attempt with the smallest `(finished_at, rank)`, the
/// same ordering that decides the race.
fn take_first_error<T>(completed: &mut Vec<AttemptReport<T>>) -> Option<BoxError> {
    let idx = completed
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r.outcome, AttemptOutcome::Err(_)))
        .min_by_key(|(_, r)| (r.finished_at, r.rank))
        .map(|(i, _)| i)?;
    match completed.swap_remove(idx).outcome {
        AttemptOutcome::Err(error) => Some(error),
        _ => None,
    }
}

fn error_tag(error: &HedgeError) -> String {
    match error {
        HedgeError::Timeout { .. } => "timeout".to_string(),
        HedgeError::RequestFailed { cause, .. } => cause.to_string(),
        HedgeError::AllAttemptsFailed { cause, .. } => cause.to_string(),
        other => other.to_string(),
    }
}

static DEFAULT_EXECUTOR: Lazy<Arc<HedgeExecutor>> = Lazy::new(|| {
    Arc::new(HedgeExecutor::new(
        default_registry(),
        Arc::new(MetricsSink::default()),
        Arc::new(TelemetryBus::new()),
    ))
});

/// The process-wide executor behind the top-level convenience API. Prefer
/// explicit [`HedgeExecutor`] handles in anything beyond scripts and tests.
pub fn default_executor() -> Arc<HedgeExecutor> {
    DEFAULT_EXECUTOR.clone()
}
