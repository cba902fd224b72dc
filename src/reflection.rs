// =============================================================================
// Self-Reflection — Bayesian trust updates after settlement
// =============================================================================
//
// Each tracked source carries a Beta(alpha, beta) posterior over "this source
// calls the direction correctly", starting from a mild prior. Every settled
// verdict updates the posterior of each source that contributed to it:
// alpha += 1 on a correct call, beta += 1 otherwise. Trust is the posterior
// mean alpha / (alpha + beta).
//
// Outputs are advisory:
//   - recommended weights: trust normalised to the weight budget
//   - regime patterns: win/loss counters per market-regime label
//   - veto threshold suggestion from the recent win rate
// None of them are written back into the fusion configuration here.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conditions::MarketConditions;
use crate::config::{write_atomic, ReflectionParams};
use crate::types::{Decision, Direction};
use crate::verdict::Verdict;

// ---------------------------------------------------------------------------
// Trust record
// ---------------------------------------------------------------------------

/// Beta posterior and track record for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub alpha: f64,
    pub beta: f64,
    pub total_signals: u64,
    pub correct: u64,
    /// Positive for consecutive hits, negative for consecutive misses.
    pub streak: i64,
}

impl TrustRecord {
    pub fn with_prior(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            total_signals: 0,
            correct: 0,
            streak: 0,
        }
    }

    /// Posterior mean of the Beta distribution.
    pub fn trust(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn accuracy(&self) -> f64 {
        if self.total_signals == 0 {
            0.0
        } else {
            self.correct as f64 / self.total_signals as f64
        }
    }

    pub fn record(&mut self, correct: bool) {
        self.total_signals += 1;
        if correct {
            self.alpha += 1.0;
            self.correct += 1;
            self.streak = (self.streak + 1).max(1);
        } else {
            self.beta += 1.0;
            self.streak = (self.streak - 1).min(-1);
        }
    }
}

// ---------------------------------------------------------------------------
// Settled input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledSignal {
    pub source_id: String,
    pub direction: Direction,
}

/// A verdict after its real-world outcome is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledRecord {
    pub verdict_direction: Decision,
    pub confidence: f64,
    pub actual_outcome: Direction,
    pub pnl_percent: f64,
    /// Signals that contributed to the verdict.
    pub signals: Vec<SettledSignal>,
    #[serde(default)]
    pub conditions: MarketConditions,
}

impl SettledRecord {
    pub fn from_verdict(
        verdict: &Verdict,
        actual_outcome: Direction,
        pnl_percent: f64,
        conditions: Option<MarketConditions>,
    ) -> Self {
        Self {
            verdict_direction: verdict.direction,
            confidence: verdict.confidence,
            actual_outcome,
            pnl_percent,
            signals: verdict
                .breakdown
                .iter()
                .map(|c| SettledSignal {
                    source_id: c.source_id.clone(),
                    direction: c.direction,
                })
                .collect(),
            conditions: conditions.unwrap_or_default(),
        }
    }

    pub fn was_correct(&self) -> bool {
        self.verdict_direction.matches(self.actual_outcome)
    }
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TrustUpdate {
    pub source_id: String,
    pub direction_given: Direction,
    pub was_correct: bool,
    pub new_trust: f64,
    pub total_signals: u64,
    pub accuracy: f64,
    pub streak: i64,
}

/// Win/loss counters for one regime label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimePattern {
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
}

impl RegimePattern {
    pub fn trades(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        match self.trades() {
            0 => 0.5,
            n => self.wins as f64 / n as f64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeInsight {
    pub regime: String,
    pub win_rate: f64,
    pub total_trades: u32,
    pub cumulative_pnl: f64,
    pub warning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdAction {
    RaiseVetoThreshold,
    LowerVetoThreshold,
    HoldCurrent,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdSuggestion {
    pub action: ThresholdAction,
    pub recent_win_rate: f64,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectionInsight {
    pub verdict_direction: Decision,
    pub actual_outcome: Direction,
    pub was_correct: bool,
    pub pnl_percent: f64,
    pub trust_updates: Vec<TrustUpdate>,
    /// Present for actionable verdicts only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeInsight>,
    /// Present once the suggestion window is full.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_suggestion: Option<ThresholdSuggestion>,
}

/// Result of reflecting over a batch of settled records.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionReport {
    pub insights: Vec<ReflectionInsight>,
    pub trust_by_source: BTreeMap<String, f64>,
    pub recommended_weights: BTreeMap<String, f64>,
}

/// Persistable reflection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionSnapshot {
    pub trust: BTreeMap<String, TrustRecord>,
    #[serde(default)]
    pub regime_patterns: BTreeMap<String, RegimePattern>,
    #[serde(default)]
    pub total_trades_analyzed: u64,
    #[serde(default)]
    pub recent_outcomes: Vec<bool>,
    #[serde(default)]
    pub exported_at: String,
}

impl ReflectionSnapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read trust snapshot from {}", path.display()))?;
        let snapshot: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse trust snapshot from {}", path.display()))?;
        info!(
            path = %path.display(),
            sources = snapshot.trust.len(),
            trades = snapshot.total_trades_analyzed,
            "trust snapshot loaded"
        );
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise trust snapshot")?;
        write_atomic(path, &content)?;
        info!(path = %path.display(), "trust snapshot saved (atomic)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ReflectionEngine {
    params: ReflectionParams,
    trust: BTreeMap<String, TrustRecord>,
    regime_patterns: BTreeMap<String, RegimePattern>,
    /// Correctness of recent actionable verdicts, newest last.
    recent_outcomes: VecDeque<bool>,
    total_trades_analyzed: u64,
}

impl ReflectionEngine {
    /// Track `sources`, each starting from the configured prior.
    pub fn new<I, S>(params: ReflectionParams, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let trust = sources
            .into_iter()
            .map(|s| {
                (
                    s.into(),
                    TrustRecord::with_prior(params.prior_alpha, params.prior_beta),
                )
            })
            .collect();
        Self {
            params,
            trust,
            regime_patterns: BTreeMap::new(),
            recent_outcomes: VecDeque::new(),
            total_trades_analyzed: 0,
        }
    }

    /// Rebuild an engine from a snapshot. Sources in `sources` missing from
    /// the snapshot start from the prior; snapshot sources are kept.
    pub fn restore<I, S>(params: ReflectionParams, sources: I, snapshot: ReflectionSnapshot) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut engine = Self::new(params, sources);
        engine.trust.extend(snapshot.trust);
        engine.regime_patterns = snapshot.regime_patterns;
        engine.total_trades_analyzed = snapshot.total_trades_analyzed;
        let window = engine.params.suggestion_window;
        let skip = snapshot.recent_outcomes.len().saturating_sub(window);
        engine.recent_outcomes = snapshot.recent_outcomes.into_iter().skip(skip).collect();
        engine
    }

    /// Update trust from one settled record.
    ///
    /// Trust is learned from every record. Regime counters and the threshold
    /// window only count actionable verdicts, since a HOLD took no risk.
    pub fn reflect_one(&mut self, record: &SettledRecord) -> ReflectionInsight {
        let was_correct = record.was_correct();
        self.total_trades_analyzed += 1;

        let mut trust_updates = Vec::with_capacity(record.signals.len());
        for sig in &record.signals {
            let Some(trust) = self.trust.get_mut(&sig.source_id) else {
                debug!(source = %sig.source_id, "untracked source skipped in reflection");
                continue;
            };
            let correct = sig.direction == record.actual_outcome;
            trust.record(correct);
            trust_updates.push(TrustUpdate {
                source_id: sig.source_id.clone(),
                direction_given: sig.direction,
                was_correct: correct,
                new_trust: trust.trust(),
                total_signals: trust.total_signals,
                accuracy: trust.accuracy(),
                streak: trust.streak,
            });
        }

        let mut regime = None;
        let mut threshold_suggestion = None;
        if record.verdict_direction.is_actionable() {
            regime = Some(self.record_regime(record, was_correct));

            self.recent_outcomes.push_back(was_correct);
            while self.recent_outcomes.len() > self.params.suggestion_window {
                self.recent_outcomes.pop_front();
            }
            threshold_suggestion = self.threshold_suggestion();
        }

        info!(
            direction = %record.verdict_direction,
            actual = %record.actual_outcome,
            was_correct,
            updated_sources = trust_updates.len(),
            "reflection complete"
        );

        ReflectionInsight {
            verdict_direction: record.verdict_direction,
            actual_outcome: record.actual_outcome,
            was_correct,
            pnl_percent: record.pnl_percent,
            trust_updates,
            regime,
            threshold_suggestion,
        }
    }

    /// Reflect over a batch and return the updated trust and weights.
    pub fn reflect(&mut self, records: &[SettledRecord]) -> ReflectionReport {
        let insights = records.iter().map(|r| self.reflect_one(r)).collect();
        ReflectionReport {
            insights,
            trust_by_source: self.trust_scores(),
            recommended_weights: self.recommended_weights(),
        }
    }

    fn record_regime(&mut self, record: &SettledRecord, was_correct: bool) -> RegimeInsight {
        let label = record.conditions.regime_label();
        let pattern = self.regime_patterns.entry(label.clone()).or_default();
        pattern.total_pnl += record.pnl_percent;
        if was_correct {
            pattern.wins += 1;
        } else {
            pattern.losses += 1;
        }

        let win_rate = pattern.win_rate();
        let warning = win_rate < self.params.low_win_rate
            && pattern.trades() >= self.params.regime_warning_min_trades;
        if warning {
            warn!(regime = %label, win_rate, trades = pattern.trades(), "weak regime");
        }

        RegimeInsight {
            regime: label,
            win_rate,
            total_trades: pattern.trades(),
            cumulative_pnl: pattern.total_pnl,
            warning,
        }
    }

    /// Advisory veto change once the recent window is full.
    pub fn threshold_suggestion(&self) -> Option<ThresholdSuggestion> {
        let window = self.params.suggestion_window;
        if window == 0 || self.recent_outcomes.len() < window {
            return None;
        }
        let wins = self.recent_outcomes.iter().filter(|c| **c).count();
        let rate = wins as f64 / window as f64;
        let pct = rate * 100.0;

        let suggestion = if rate < self.params.low_win_rate {
            ThresholdSuggestion {
                action: ThresholdAction::RaiseVetoThreshold,
                recent_win_rate: rate,
                reason: format!(
                    "Recent win rate {pct:.0}% is weak; raise the veto threshold to {}",
                    self.params.raised_veto
                ),
                new_threshold: Some(self.params.raised_veto),
            }
        } else if rate > self.params.high_win_rate {
            ThresholdSuggestion {
                action: ThresholdAction::LowerVetoThreshold,
                recent_win_rate: rate,
                reason: format!(
                    "Recent win rate {pct:.0}% is strong; the veto threshold can drop to {}",
                    self.params.lowered_veto
                ),
                new_threshold: Some(self.params.lowered_veto),
            }
        } else {
            ThresholdSuggestion {
                action: ThresholdAction::HoldCurrent,
                recent_win_rate: rate,
                reason: format!("Recent win rate {pct:.0}% is within normal range"),
                new_threshold: None,
            }
        };
        Some(suggestion)
    }

    pub fn trust(&self, source_id: &str) -> Option<&TrustRecord> {
        self.trust.get(source_id)
    }

    pub fn trust_scores(&self) -> BTreeMap<String, f64> {
        self.trust
            .iter()
            .map(|(id, t)| (id.clone(), t.trust()))
            .collect()
    }

    /// Trust scores scaled to sum to the weight budget.
    pub fn recommended_weights(&self) -> BTreeMap<String, f64> {
        let scores = self.trust_scores();
        if scores.is_empty() {
            return scores;
        }
        let total: f64 = scores.values().sum();
        if !(total > 0.0) {
            let equal = 1.0 / scores.len() as f64;
            return scores.into_keys().map(|k| (k, equal)).collect();
        }
        let budget = self.params.weight_budget;
        scores
            .into_iter()
            .map(|(k, v)| (k, v / total * budget))
            .collect()
    }

    pub fn regime_patterns(&self) -> &BTreeMap<String, RegimePattern> {
        &self.regime_patterns
    }

    pub fn total_trades_analyzed(&self) -> u64 {
        self.total_trades_analyzed
    }

    pub fn export_state(&self) -> ReflectionSnapshot {
        ReflectionSnapshot {
            trust: self.trust.clone(),
            regime_patterns: self.regime_patterns.clone(),
            total_trades_analyzed: self.total_trades_analyzed,
            recent_outcomes: self.recent_outcomes.iter().copied().collect(),
            exported_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
