// =============================================================================
// Engine Configuration — thresholds, limits and roster with atomic save
// =============================================================================
//
// Every tunable of the fusion pipeline lives here: fusion gates, breaker
// limits, Kelly sizing, Monte Carlo horizon and the reflection prior. The
// governance constants (veto 0.55, 3 % drawdown, 5 losses) are product
// tuning, not derived values, so they are injected rather than hardcoded.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_min_confidence_input() -> f64 {
    0.50
}

fn default_min_signals() -> usize {
    2
}

fn default_veto_threshold() -> f64 {
    0.55
}

fn default_roster() -> BTreeMap<String, f64> {
    [
        ("market_data", 0.25),
        ("sentiment", 0.15),
        ("anomaly", 0.15),
        ("order_flow", 0.10),
        ("macro_regime", 0.10),
        ("volatility", 0.10),
    ]
    .into_iter()
    .map(|(id, w)| (id.to_string(), w))
    .collect()
}

fn default_max_drawdown_limit() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_max_position() -> f64 {
    0.25
}

fn default_n_simulations() -> usize {
    10_000
}

fn default_n_steps() -> usize {
    6
}

fn default_max_simulations() -> usize {
    200_000
}

fn default_max_steps() -> usize {
    10_000
}

fn default_step_minutes() -> u32 {
    10
}

fn default_drift() -> f64 {
    0.001
}

fn default_prior() -> f64 {
    2.0
}

fn default_weight_budget() -> f64 {
    0.85
}

fn default_suggestion_window() -> usize {
    10
}

fn default_low_win_rate() -> f64 {
    0.40
}

fn default_high_win_rate() -> f64 {
    0.70
}

fn default_raised_veto() -> f64 {
    0.60
}

fn default_lowered_veto() -> f64 {
    0.52
}

fn default_regime_warning_min_trades() -> u32 {
    5
}

fn default_rsi_period() -> usize {
    14
}

fn default_fast_ema() -> usize {
    9
}

fn default_slow_ema() -> usize {
    21
}

fn default_low_vol() -> f64 {
    0.002
}

fn default_high_vol() -> f64 {
    0.01
}

// =============================================================================
// Sections
// =============================================================================

/// Gates applied while ingesting and fusing signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionParams {
    /// Signals below this confidence are rejected at ingestion.
    #[serde(default = "default_min_confidence_input")]
    pub min_confidence_input: f64,

    /// Minimum accepted signals before fusion produces a directional verdict.
    #[serde(default = "default_min_signals")]
    pub min_signals: usize,

    /// Fused confidence strictly below this is vetoed to HOLD.
    #[serde(default = "default_veto_threshold")]
    pub veto_threshold: f64,

    /// Registered contributors and their default weights.
    #[serde(default = "default_roster")]
    pub roster: BTreeMap<String, f64>,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            min_confidence_input: default_min_confidence_input(),
            min_signals: default_min_signals(),
            veto_threshold: default_veto_threshold(),
            roster: default_roster(),
        }
    }
}

/// Circuit breaker limits for one accounting period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerParams {
    /// Period loss (in percent) at which the breaker trips, e.g. 3.0.
    #[serde(default = "default_max_drawdown_limit")]
    pub max_drawdown_limit: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            max_drawdown_limit: default_max_drawdown_limit(),
            max_consecutive_losses: default_max_consecutive_losses(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingParams {
    /// Multiplier on full Kelly (0.25 = quarter-Kelly).
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,

    /// Absolute cap on the stake fraction.
    #[serde(default = "default_max_position")]
    pub max_position: f64,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            kelly_fraction: default_kelly_fraction(),
            max_position: default_max_position(),
        }
    }
}

/// Monte Carlo horizon and RNG settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloParams {
    #[serde(default = "default_n_simulations")]
    pub n_simulations: usize,

    /// Steps per path (6 × 10 min = one hour horizon).
    #[serde(default = "default_n_steps")]
    pub n_steps: usize,

    /// Duration of one step; drives Sharpe annualisation.
    #[serde(default = "default_step_minutes")]
    pub step_minutes: u32,

    /// Fixed master seed. `None` draws one from OS entropy per run.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Per-step drift magnitude used when refining an actionable verdict.
    #[serde(default = "default_drift")]
    pub drift: f64,

    /// Upper bound on `n_simulations`, including per-request overrides.
    #[serde(default = "default_max_simulations")]
    pub max_simulations: usize,

    /// Upper bound on `n_steps`, including per-request overrides.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for MonteCarloParams {
    fn default() -> Self {
        Self {
            n_simulations: default_n_simulations(),
            n_steps: default_n_steps(),
            step_minutes: default_step_minutes(),
            seed: None,
            drift: default_drift(),
            max_simulations: default_max_simulations(),
            max_steps: default_max_steps(),
        }
    }
}

impl MonteCarloParams {
    /// Steps per year for the configured step duration.
    pub fn periods_per_year(&self) -> f64 {
        (60.0 / self.step_minutes as f64) * 24.0 * 365.0
    }
}

/// Beta prior, weight budget and advisory-threshold rules for reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionParams {
    #[serde(default = "default_prior")]
    pub prior_alpha: f64,

    #[serde(default = "default_prior")]
    pub prior_beta: f64,

    /// Sum of recommended weights across tracked sources.
    #[serde(default = "default_weight_budget")]
    pub weight_budget: f64,

    /// Settled verdicts considered for the veto-threshold suggestion.
    #[serde(default = "default_suggestion_window")]
    pub suggestion_window: usize,

    #[serde(default = "default_low_win_rate")]
    pub low_win_rate: f64,

    #[serde(default = "default_high_win_rate")]
    pub high_win_rate: f64,

    #[serde(default = "default_raised_veto")]
    pub raised_veto: f64,

    #[serde(default = "default_lowered_veto")]
    pub lowered_veto: f64,

    /// A regime is flagged once it has this many trades and a win rate
    /// below `low_win_rate`.
    #[serde(default = "default_regime_warning_min_trades")]
    pub regime_warning_min_trades: u32,
}

impl Default for ReflectionParams {
    fn default() -> Self {
        Self {
            prior_alpha: default_prior(),
            prior_beta: default_prior(),
            weight_budget: default_weight_budget(),
            suggestion_window: default_suggestion_window(),
            low_win_rate: default_low_win_rate(),
            high_win_rate: default_high_win_rate(),
            raised_veto: default_raised_veto(),
            lowered_veto: default_lowered_veto(),
            regime_warning_min_trades: default_regime_warning_min_trades(),
        }
    }
}

/// Indicator settings for regime labelling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionsParams {
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_fast_ema")]
    pub fast_ema: usize,

    #[serde(default = "default_slow_ema")]
    pub slow_ema: usize,

    /// Per-step sigma below this is the "low" band.
    #[serde(default = "default_low_vol")]
    pub low_vol: f64,

    /// Per-step sigma above this is the "high" band.
    #[serde(default = "default_high_vol")]
    pub high_vol: f64,
}

impl Default for ConditionsParams {
    fn default() -> Self {
        Self {
            rsi_period: default_rsi_period(),
            fast_ema: default_fast_ema(),
            slow_ema: default_slow_ema(),
            low_vol: default_low_vol(),
            high_vol: default_high_vol(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the fusion engine.
///
/// Every section has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub fusion: FusionParams,

    #[serde(default)]
    pub breaker: BreakerParams,

    #[serde(default)]
    pub sizing: SizingParams,

    #[serde(default)]
    pub monte_carlo: MonteCarloParams,

    #[serde(default)]
    pub reflection: ReflectionParams,

    #[serde(default)]
    pub conditions: ConditionsParams,
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid engine config in {}", path.display()))?;

        info!(
            path = %path.display(),
            sources = config.fusion.roster.len(),
            veto_threshold = config.fusion.veto_threshold,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        write_atomic(path, &content)?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Reject values outside the documented domains.
    pub fn validate(&self) -> Result<(), EngineError> {
        let f = &self.fusion;
        if !(0.0..=1.0).contains(&f.min_confidence_input) {
            return Err(bad("fusion.min_confidence_input", f.min_confidence_input));
        }
        if f.min_signals == 0 {
            return Err(EngineError::Config("fusion.min_signals must be >= 1".into()));
        }
        if !(f.veto_threshold > 0.5 && f.veto_threshold < 1.0) {
            return Err(bad("fusion.veto_threshold", f.veto_threshold));
        }
        if f.roster.is_empty() {
            return Err(EngineError::Config("fusion.roster is empty".into()));
        }
        if let Some((id, w)) = f.roster.iter().find(|(_, w)| !(0.0..=1.0).contains(*w)) {
            return Err(EngineError::Config(format!(
                "fusion.roster weight for '{id}' out of [0, 1]: {w}"
            )));
        }

        let b = &self.breaker;
        if !(b.max_drawdown_limit > 0.0) {
            return Err(bad("breaker.max_drawdown_limit", b.max_drawdown_limit));
        }
        if b.max_consecutive_losses == 0 {
            return Err(EngineError::Config(
                "breaker.max_consecutive_losses must be >= 1".into(),
            ));
        }

        let s = &self.sizing;
        if !(s.kelly_fraction > 0.0 && s.kelly_fraction <= 1.0) {
            return Err(bad("sizing.kelly_fraction", s.kelly_fraction));
        }
        if !(0.0..=1.0).contains(&s.max_position) {
            return Err(bad("sizing.max_position", s.max_position));
        }

        let m = &self.monte_carlo;
        if m.n_simulations == 0 || m.n_steps == 0 || m.step_minutes == 0 {
            return Err(EngineError::Config(
                "monte_carlo.n_simulations, n_steps and step_minutes must be >= 1".into(),
            ));
        }
        if m.n_simulations > m.max_simulations || m.n_steps > m.max_steps {
            return Err(EngineError::Config(format!(
                "monte_carlo horizon {}x{} exceeds the {}x{} cap",
                m.n_simulations, m.n_steps, m.max_simulations, m.max_steps
            )));
        }
        if !m.drift.is_finite() {
            return Err(bad("monte_carlo.drift", m.drift));
        }

        let r = &self.reflection;
        if !(r.prior_alpha > 0.0 && r.prior_beta > 0.0) {
            return Err(EngineError::Config("reflection priors must be > 0".into()));
        }
        if !(r.weight_budget > 0.0 && r.weight_budget <= 1.0) {
            return Err(bad("reflection.weight_budget", r.weight_budget));
        }

        let c = &self.conditions;
        if c.fast_ema == 0 || c.slow_ema <= c.fast_ema || c.rsi_period == 0 {
            return Err(EngineError::Config(
                "conditions: need rsi_period >= 1 and 1 <= fast_ema < slow_ema".into(),
            ));
        }

        Ok(())
    }
}

fn bad(field: &str, value: f64) -> EngineError {
    EngineError::Config(format!("{field} out of range: {value}"))
}

/// Write `content` to a temporary sibling file, then rename over `path`.
///
/// This prevents corruption if the process crashes mid-write.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    std::fs::write(&tmp_path, content)
        .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp file to {}", path.display()))?;

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!((cfg.fusion.veto_threshold - 0.55).abs() < f64::EPSILON);
        assert!((cfg.fusion.min_confidence_input - 0.50).abs() < f64::EPSILON);
        assert_eq!(cfg.fusion.min_signals, 2);
        assert_eq!(cfg.fusion.roster.len(), 6);
        assert!((cfg.fusion.roster["market_data"] - 0.25).abs() < f64::EPSILON);
        assert!((cfg.breaker.max_drawdown_limit - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.breaker.max_consecutive_losses, 5);
        assert!((cfg.sizing.kelly_fraction - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.monte_carlo.n_simulations, 10_000);
        assert_eq!(cfg.monte_carlo.n_steps, 6);
        assert!(cfg.monte_carlo.seed.is_none());
        assert!((cfg.reflection.weight_budget - 0.85).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.fusion.min_signals, 2);
        assert_eq!(cfg.breaker.max_consecutive_losses, 5);
        assert_eq!(cfg.monte_carlo.step_minutes, 10);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "fusion": { "veto_threshold": 0.6 }, "monte_carlo": { "seed": 7 } }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.fusion.veto_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.fusion.roster.len(), 6);
        assert_eq!(cfg.monte_carlo.seed, Some(7));
        assert_eq!(cfg.monte_carlo.n_simulations, 10_000);
    }

    #[test]
    fn periods_per_year_for_ten_minute_steps() {
        let m = MonteCarloParams::default();
        assert!((m.periods_per_year() - 6.0 * 24.0 * 365.0).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_out_of_domain_values() {
        let mut cfg = EngineConfig::default();
        cfg.fusion.veto_threshold = 0.4;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.monte_carlo.n_steps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.fusion.roster.insert("rogue".into(), 1.5);
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.monte_carlo.n_steps = cfg.monte_carlo.max_steps + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = std::env::temp_dir().join(format!("fusion-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.json");

        let mut cfg = EngineConfig::default();
        cfg.breaker.max_consecutive_losses = 7;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.breaker.max_consecutive_losses, 7);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
