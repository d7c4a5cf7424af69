//! Per-request outcome metadata.
//!
//! Every hedged call produces a [`HedgeOutcome`] alongside its value: whether
//! a backup fired, which attempt won, the delay the strategy chose, and the
//! observed latencies. The same value is what strategies learn from; on
//! error paths it additionally carries the `error` tag.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::StrategyKind;

/// Which attempt produced a report: the primary, or the n-th backup
/// (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptRole {
    Primary,
    Backup(usize),
}

impl AttemptRole {
    pub fn is_backup(&self) -> bool {
        matches!(self, AttemptRole::Backup(_))
    }
}

impl fmt::Display for AttemptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptRole::Primary => f.write_str("primary"),
            AttemptRole::Backup(n) => write!(f, "backup-{n}"),
        }
    }
}

/// Structured outcome of a single hedged call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeOutcome {
    /// True when at least one backup was fired.
    pub hedged: bool,

    /// True when a backup provided the winning value.
    pub hedge_won: bool,

    /// The delay the strategy produced before the primary started, even if
    /// the primary finished sooner and no backup was ever launched. `None`
    /// when the strategy never hedges.
    pub hedge_delay: Option<u64>,

    /// Primary invocation latency in ms, when the primary delivered a
    /// terminal outcome.
    pub primary_latency: Option<u64>,

    /// Winning backup latency in ms when a backup won; otherwise the first
    /// backup that delivered an outcome, if any.
    pub backup_latency: Option<u64>,

    /// Elapsed ms from call entry to completion.
    pub total_latency: u64,

    /// `1 + (number of backups actually fired)`. A count-like indicator of
    /// extra work, not a currency amount.
    pub cost: f64,

    /// Strategy consulted for this request.
    pub strategy: StrategyKind,

    /// Error tag, set only when the call ended on the error path. Strategy
    /// `update` sees it; callers receive the typed error instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HedgeOutcome {
    /// An outcome skeleton before any attempt has completed.
    pub fn new(strategy: StrategyKind, hedge_delay: Option<u64>) -> Self {
        Self {
            hedged: false,
            hedge_won: false,
            hedge_delay,
            primary_latency: None,
            backup_latency: None,
            total_latency: 0,
            cost: 1.0,
            strategy,
            error: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// String map of the outcome fields, used as telemetry event metadata.
    pub fn metadata_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("hedged".to_string(), self.hedged.to_string());
        map.insert("hedge_won".to_string(), self.hedge_won.to_string());
        map.insert("strategy".to_string(), self.strategy.to_string());
        map.insert("cost".to_string(), format!("{:.1}", self.cost));
        if let Some(d) = self.hedge_delay {
            map.insert("hedge_delay".to_string(), d.to_string());
        }
        if let Some(p) = self.primary_latency {
            map.insert("primary_latency".to_string(), p.to_string());
        }
        if let Some(b) = self.backup_latency {
            map.insert("backup_latency".to_string(), b.to_string());
        }
        map.insert("total_latency".to_string(), self.total_latency.to_string());
        if let Some(e) = &self.error {
            map.insert("error".to_string(), e.clone());
        }
        map
    }
}
