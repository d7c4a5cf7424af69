//! Configuration system for the hedging engine
//!
//! Provides the per-request [`HedgeConfig`] value, strategy selection, a
//! fluent builder, validation of the strategy dispatch rules, and loaders
//! for TOML files. Once a configuration is accepted by [`HedgeConfig::validate`]
//! its values are frozen for the lifetime of the call.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{HedgeError, Result};

/// Default overall deadline for a hedged request, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Default upper bound on concurrent backups.
pub const DEFAULT_MAX_HEDGES: usize = 1;
/// Default namespace prepended to every emitted telemetry event.
pub const DEFAULT_TELEMETRY_PREFIX: &str = "hedge";

/// Rolling-percentile defaults.
pub const DEFAULT_WINDOW_SIZE: usize = 1000;
pub const DEFAULT_MIN_SAMPLES: usize = 10;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default candidate delays for the Thompson-sampling bandit, in ms.
pub const DEFAULT_DELAY_CANDIDATES: [u64; 5] = [50, 100, 200, 500, 1000];

/// Workload-aware default base delay, in ms.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Exponential-backoff defaults.
pub const DEFAULT_EXP_BASE_DELAY: f64 = 100.0;
pub const DEFAULT_EXP_MIN_DELAY: f64 = 10.0;
pub const DEFAULT_EXP_MAX_DELAY: f64 = 5000.0;
pub const DEFAULT_EXP_INCREASE: f64 = 1.5;
pub const DEFAULT_EXP_DECREASE: f64 = 0.9;
pub const DEFAULT_EXP_ERROR: f64 = 2.0;

/// Which delay-selection strategy a request consults.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Constant delay from `delay_ms`.
    Fixed,
    /// Rolling nearest-rank percentile of observed latencies.
    Percentile,
    /// Thompson-sampling bandit over `delay_candidates`.
    Adaptive,
    /// Stateless multiplier over workload tags.
    WorkloadAware,
    /// Multiplicative increase/decrease on hedge outcomes.
    ExpBackoff,
    /// Never hedge; await the primary to completion or deadline.
    #[default]
    Off,
}

impl StrategyKind {
    /// The snake_case wire name, also used as the default instance name for
    /// stateful strategies.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Fixed => "fixed",
            StrategyKind::Percentile => "percentile",
            StrategyKind::Adaptive => "adaptive",
            StrategyKind::WorkloadAware => "workload_aware",
            StrategyKind::ExpBackoff => "exp_backoff",
            StrategyKind::Off => "off",
        }
    }

    /// Whether instances of this kind carry state worth registering under a
    /// name. Stateless kinds are constructed fresh per call.
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            StrategyKind::Percentile | StrategyKind::Adaptive | StrategyKind::ExpBackoff
        )
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request hedging configuration.
///
/// Field names are the normative option names; unset strategy-specific
/// fields fall back to the documented defaults at instance creation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HedgeConfig {
    /// Delay-selection strategy to consult.
    pub strategy: StrategyKind,

    /// Selects which instance of a stateful strategy to consult, letting a
    /// caller keep distinct state per backend. Defaults to the kind name.
    pub strategy_name: Option<String>,

    /// Fixed strategy: the constant delay, required.
    pub delay_ms: Option<u64>,

    /// Percentile strategy: p in `[50, 99]`, required.
    pub percentile: Option<f64>,

    /// Percentile strategy: FIFO sample window length.
    pub window_size: Option<usize>,

    /// Percentile strategy: samples needed before the delay is recomputed.
    pub min_samples: Option<usize>,

    /// Percentile strategy: delay used until enough samples arrive, in ms.
    pub initial_delay: Option<u64>,

    /// Adaptive strategy: candidate delays the bandit chooses among, in ms.
    pub delay_candidates: Option<Vec<u64>>,

    /// Adaptive strategy: scale applied to Beta parameter increments.
    pub learning_rate: Option<f64>,

    /// Workload-aware strategy: delay before multipliers, in ms.
    pub base_delay: Option<u64>,

    /// Workload-aware tag: characters in the prompt.
    pub prompt_length: Option<u64>,

    /// Workload-aware tag: `simple` | `medium` | `complex`.
    pub model_complexity: Option<String>,

    /// Workload-aware tag: `peak` | `normal` | `off_peak`.
    pub time_of_day: Option<String>,

    /// Workload-aware tag: `high` | `normal` | `low`.
    pub priority: Option<String>,

    /// Exponential-backoff: starting delay, in ms.
    pub exponential_base_delay: Option<f64>,

    /// Exponential-backoff: lower clamp, in ms.
    pub exponential_min_delay: Option<f64>,

    /// Exponential-backoff: upper clamp, in ms.
    pub exponential_max_delay: Option<f64>,

    /// Exponential-backoff: multiplier applied when a hedge fired and lost.
    pub exponential_increase_factor: Option<f64>,

    /// Exponential-backoff: multiplier applied when a hedge won or the
    /// primary was fast enough that no backup fired.
    pub exponential_decrease_factor: Option<f64>,

    /// Exponential-backoff: multiplier applied on an error outcome.
    pub exponential_error_factor: Option<f64>,

    /// Upper bound on concurrent backups, at least 1.
    pub max_hedges: usize,

    /// Deadline for the whole request (primary plus all backups), measured
    /// from call entry. `0` means the deadline has already elapsed.
    pub timeout_ms: u64,

    /// Whether to abort losing attempts once a winner is chosen.
    pub enable_cancellation: bool,

    /// Namespace prepended to every emitted telemetry event.
    pub telemetry_prefix: String,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Off,
            strategy_name: None,
            delay_ms: None,
            percentile: None,
            window_size: None,
            min_samples: None,
            initial_delay: None,
            delay_candidates: None,
            learning_rate: None,
            base_delay: None,
            prompt_length: None,
            model_complexity: None,
            time_of_day: None,
            priority: None,
            exponential_base_delay: None,
            exponential_min_delay: None,
            exponential_max_delay: None,
            exponential_increase_factor: None,
            exponential_decrease_factor: None,
            exponential_error_factor: None,
            max_hedges: DEFAULT_MAX_HEDGES,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            enable_cancellation: true,
            telemetry_prefix: DEFAULT_TELEMETRY_PREFIX.to_string(),
        }
    }
}

impl HedgeConfig {
    /// Starts a fluent builder.
    pub fn builder() -> HedgeConfigBuilder {
        HedgeConfigBuilder::default()
    }

    /// The instance name used to locate stateful strategy state.
    pub fn effective_strategy_name(&self) -> String {
        self.strategy_name
            .clone()
            .unwrap_or_else(|| self.strategy.as_str().to_string())
    }

    /// Resolved exponential-backoff parameters
    /// `(base, min, max, inc, dec, err)`.
    pub fn exponential_params(&self) -> (f64, f64, f64, f64, f64, f64) {
        (
            self.exponential_base_delay.unwrap_or(DEFAULT_EXP_BASE_DELAY),
            self.exponential_min_delay.unwrap_or(DEFAULT_EXP_MIN_DELAY),
            self.exponential_max_delay.unwrap_or(DEFAULT_EXP_MAX_DELAY),
            self.exponential_increase_factor.unwrap_or(DEFAULT_EXP_INCREASE),
            self.exponential_decrease_factor.unwrap_or(DEFAULT_EXP_DECREASE),
            self.exponential_error_factor.unwrap_or(DEFAULT_EXP_ERROR),
        )
    }

    /// Rejects configurations that violate a strategy dispatch rule.
    ///
    /// Raised synchronously at `request` entry; never surfaced via
    /// telemetry. Accepted values are frozen for the lifetime of the call.
    pub fn validate(&self) -> Result<()> {
        if self.max_hedges == 0 {
            return Err(invalid("max_hedges must be at least 1"));
        }
        match self.strategy {
            StrategyKind::Fixed => {
                if self.delay_ms.is_none() {
                    return Err(invalid("fixed strategy requires delay_ms"));
                }
            }
            StrategyKind::Percentile => match self.percentile {
                None => return Err(invalid("percentile strategy requires percentile")),
                Some(p) if !(50.0..=99.0).contains(&p) => {
                    return Err(invalid("percentile must be within [50, 99]"))
                }
                Some(_) => {}
            },
            StrategyKind::Adaptive => {
                if let Some(candidates) = &self.delay_candidates {
                    if candidates.len() < 2 {
                        return Err(invalid("delay_candidates requires at least 2 entries"));
                    }
                }
                if let Some(lr) = self.learning_rate {
                    if lr <= 0.0 {
                        return Err(invalid("learning_rate must be positive"));
                    }
                }
            }
            StrategyKind::ExpBackoff => {
                let (base, min, max, inc, dec, err) = self.exponential_params();
                if min < 0.0 {
                    return Err(invalid("exponential_min_delay must be non-negative"));
                }
                if min >= max {
                    return Err(invalid(
                        "exponential_min_delay must be below exponential_max_delay",
                    ));
                }
                if base < min || base > max {
                    return Err(invalid(
                        "exponential_base_delay must lie within [min_delay, max_delay]",
                    ));
                }
                if inc <= 1.0 {
                    return Err(invalid("exponential_increase_factor must exceed 1"));
                }
                if !(0.0..1.0).contains(&dec) || dec == 0.0 {
                    return Err(invalid(
                        "exponential_decrease_factor must lie strictly within (0, 1)",
                    ));
                }
                if err <= 1.0 {
                    return Err(invalid("exponential_error_factor must exceed 1"));
                }
            }
            StrategyKind::WorkloadAware | StrategyKind::Off => {}
        }
        Ok(())
    }
}

fn invalid(message: &str) -> HedgeError {
    HedgeError::InvalidConfig {
        message: message.to_string(),
    }
}

/// Fluent builder over [`HedgeConfig`].
#[derive(Debug, Default)]
pub struct HedgeConfigBuilder {
    config: HedgeConfig,
}

impl HedgeConfigBuilder {
    pub fn strategy(mut self, kind: StrategyKind) -> Self {
        self.config.strategy = kind;
        self
    }

    pub fn strategy_name(mut self, name: impl Into<String>) -> Self {
        self.config.strategy_name = Some(name.into());
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.config.delay_ms = Some(ms);
        self
    }

    pub fn percentile(mut self, p: f64) -> Self {
        self.config.percentile = Some(p);
        self
    }

    pub fn window_size(mut self, n: usize) -> Self {
        self.config.window_size = Some(n);
        self
    }

    pub fn min_samples(mut self, n: usize) -> Self {
        self.config.min_samples = Some(n);
        self
    }

    pub fn initial_delay(mut self, ms: u64) -> Self {
        self.config.initial_delay = Some(ms);
        self
    }

    pub fn delay_candidates(mut self, candidates: Vec<u64>) -> Self {
        self.config.delay_candidates = Some(candidates);
        self
    }

    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.config.learning_rate = Some(lr);
        self
    }

    pub fn base_delay(mut self, ms: u64) -> Self {
        self.config.base_delay = Some(ms);
        self
    }

    pub fn prompt_length(mut self, chars: u64) -> Self {
        self.config.prompt_length = Some(chars);
        self
    }

    pub fn model_complexity(mut self, tag: impl Into<String>) -> Self {
        self.config.model_complexity = Some(tag.into());
        self
    }

    pub fn time_of_day(mut self, tag: impl Into<String>) -> Self {
        self.config.time_of_day = Some(tag.into());
        self
    }

    pub fn priority(mut self, tag: impl Into<String>) -> Self {
        self.config.priority = Some(tag.into());
        self
    }

    pub fn exponential_base_delay(mut self, ms: f64) -> Self {
        self.config.exponential_base_delay = Some(ms);
        self
    }

    pub fn exponential_min_delay(mut self, ms: f64) -> Self {
        self.config.exponential_min_delay = Some(ms);
        self
    }

    pub fn exponential_max_delay(mut self, ms: f64) -> Self {
        self.config.exponential_max_delay = Some(ms);
        self
    }

    pub fn exponential_increase_factor(mut self, f: f64) -> Self {
        self.config.exponential_increase_factor = Some(f);
        self
    }

    pub fn exponential_decrease_factor(mut self, f: f64) -> Self {
        self.config.exponential_decrease_factor = Some(f);
        self
    }

    pub fn exponential_error_factor(mut self, f: f64) -> Self {
        self.config.exponential_error_factor = Some(f);
        self
    }

    pub fn max_hedges(mut self, n: usize) -> Self {
        self.config.max_hedges = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn enable_cancellation(mut self, enabled: bool) -> Self {
        self.config.enable_cancellation = enabled;
        self
    }

    pub fn telemetry_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.telemetry_prefix = prefix.into();
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<HedgeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load a configuration from a TOML file.
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<HedgeConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| HedgeError::InvalidConfig {
        message: format!("cannot read config file: {e}"),
    })?;
    let config: HedgeConfig = toml::from_str(&contents).map_err(|e| HedgeError::InvalidConfig {
        message: format!("cannot parse config file: {e}"),
    })?;
    config.validate()?;
    Ok(config)
}

/// JSON schema for [`HedgeConfig`], advertising the accepted option names.
///
/// Embedders (for example the tower layer in [`crate::service`]) surface
/// this to callers that validate options before handing them over.
pub fn config_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(HedgeConfig);
    serde_json::to_value(schema.schema).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HedgeConfig::default();
        assert_eq!(config.strategy, StrategyKind::Off);
        assert_eq!(config.max_hedges, 1);
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.enable_cancellation);
        assert_eq!(config.telemetry_prefix, "hedge");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_kind_wire_names() {
        let kinds = [
            (StrategyKind::Fixed, "\"fixed\""),
            (StrategyKind::Percentile, "\"percentile\""),
            (StrategyKind::Adaptive, "\"adaptive\""),
            (StrategyKind::WorkloadAware, "\"workload_aware\""),
            (StrategyKind::ExpBackoff, "\"exp_backoff\""),
            (StrategyKind::Off, "\"off\""),
        ];
        for (kind, wire) in kinds {
            assert_eq!(serde_json::to_string(&kind).unwrap(), wire);
            let back: StrategyKind = serde_json::from_str(wire).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn test_fixed_requires_delay() {
        let config = HedgeConfig {
            strategy: StrategyKind::Fixed,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HedgeConfig::builder()
            .strategy(StrategyKind::Fixed)
            .delay_ms(75)
            .build()
            .unwrap();
        assert_eq!(config.delay_ms, Some(75));
    }

    #[test]
    fn test_percentile_bounds() {
        for p in [49.9, 99.1, 0.95] {
            let config = HedgeConfig {
                strategy: StrategyKind::Percentile,
                percentile: Some(p),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "p={p} should be rejected");
        }
        let config = HedgeConfig {
            strategy: StrategyKind::Percentile,
            percentile: Some(95.0),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let missing = HedgeConfig {
            strategy: StrategyKind::Percentile,
            ..Default::default()
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_adaptive_candidates() {
        let config = HedgeConfig {
            strategy: StrategyKind::Adaptive,
            delay_candidates: Some(vec![100]),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Omitted candidates fall back to the default set.
        let config = HedgeConfig {
            strategy: StrategyKind::Adaptive,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exponential_rules() {
        let bad = [
            HedgeConfig {
                strategy: StrategyKind::ExpBackoff,
                exponential_min_delay: Some(100.0),
                exponential_max_delay: Some(50.0),
                ..Default::default()
            },
            HedgeConfig {
                strategy: StrategyKind::ExpBackoff,
                exponential_base_delay: Some(6000.0),
                ..Default::default()
            },
            HedgeConfig {
                strategy: StrategyKind::ExpBackoff,
                exponential_increase_factor: Some(1.0),
                ..Default::default()
            },
            HedgeConfig {
                strategy: StrategyKind::ExpBackoff,
                exponential_decrease_factor: Some(1.2),
                ..Default::default()
            },
            HedgeConfig {
                strategy: StrategyKind::ExpBackoff,
                exponential_error_factor: Some(0.5),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err());
        }

        let config = HedgeConfig {
            strategy: StrategyKind::ExpBackoff,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.exponential_params(),
            (100.0, 10.0, 5000.0, 1.5, 0.9, 2.0)
        );
    }

    #[test]
    fn test_max_hedges_floor() {
        let config = HedgeConfig {
            max_hedges: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_strategy_name() {
        let config = HedgeConfig {
            strategy: StrategyKind::ExpBackoff,
            ..Default::default()
        };
        assert_eq!(config.effective_strategy_name(), "exp_backoff");

        let config = HedgeConfig {
            strategy: StrategyKind::ExpBackoff,
            strategy_name: Some("search-backend".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_strategy_name(), "search-backend");
    }

    #[test]
    fn test_toml_roundtrip() {
        let parsed: HedgeConfig = toml::from_str(
            r#"
            strategy = "percentile"
            percentile = 95.0
            window_size = 500
            max_hedges = 3
            timeout_ms = 10000
            "#,
        )
        .unwrap();
        assert_eq!(parsed.strategy, StrategyKind::Percentile);
        assert_eq!(parsed.percentile, Some(95.0));
        assert_eq!(parsed.window_size, Some(500));
        assert_eq!(parsed.max_hedges, 3);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_config_schema_advertises_options() {
        let schema = config_schema();
        let props = schema["properties"].as_object().unwrap();
        for key in [
            "strategy",
            "strategy_name",
            "delay_ms",
            "percentile",
            "delay_candidates",
            "max_hedges",
            "timeout_ms",
            "enable_cancellation",
            "telemetry_prefix",
        ] {
            assert!(props.contains_key(key), "schema missing {key}");
        }
    }
}
