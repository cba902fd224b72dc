// =============================================================================
// Verdict — auditable result of one decision cycle
// =============================================================================
//
// Every cycle ends in exactly one Verdict, whichever layer decided it: the
// circuit breaker, the minimum-signal gate, the veto gate, or a fused
// directional call. The verdict captures the inputs each layer saw so the
// decision can be audited after settlement.
//
// Verdicts are built through the constructors below and never mutated; the
// Monte Carlo refinement consumes one verdict and returns a new one.
// =============================================================================

use serde::Serialize;

use crate::monte_carlo::{RiskOverride, RiskReport};
use crate::recommendation::Recommendation;
use crate::sizing::combine_stakes;
use crate::types::{Decision, Direction};

pub const ENGINE_VERSION: &str = concat!("fusion-oracle-", env!("CARGO_PKG_VERSION"));

/// Contribution of one accepted signal to the fused log-odds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalContribution {
    pub source_id: String,
    pub direction: Direction,
    pub confidence: f64,
    pub weight: f64,
    /// Likelihood ratio after SHORT inversion.
    pub likelihood_ratio: f64,
    pub weighted_log_lr: f64,
    pub reasoning: String,
}

/// A signal turned away at ingestion, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedSignal {
    pub source_id: String,
    pub reason: String,
}

/// Complete auditable record of one fusion cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    /// Unique identifier for this verdict (UUID v4).
    pub id: String,

    pub direction: Decision,

    /// Fused confidence in `direction` (0 on short-circuit verdicts).
    pub confidence: f64,

    pub log_odds: f64,

    /// `exp(log_odds)`; infinite when |log_odds| >= 500.
    pub fused_odds: f64,

    pub signals_used: usize,
    pub signals_rejected: usize,

    pub veto_applied: bool,

    /// Why the verdict was forced to HOLD by the veto or the signal gate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub veto_reason: Option<String>,

    pub circuit_breaker: bool,

    /// 0 (benign) to 100 (blocked).
    pub risk_score: f64,

    /// Confidence-based quarter-Kelly stake.
    pub kelly_fraction: f64,

    /// Final stake: `kelly_fraction`, reduced by the Monte Carlo cap when a
    /// risk report is attached.
    pub position_size: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_report: Option<RiskReport>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_override: Option<RiskOverride>,

    /// Advisory cross-check against the TA consensus. Never alters
    /// `direction` or `position_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,

    pub breakdown: Vec<SignalContribution>,
    pub rejected: Vec<RejectedSignal>,

    /// ISO 8601 timestamp of when this verdict was created.
    pub created_at: String,

    pub engine_version: String,
}

/// Fields of a fused verdict, gathered by the fusion engine.
#[derive(Debug, Clone)]
pub(crate) struct FusedParts {
    pub direction: Decision,
    pub confidence: f64,
    pub log_odds: f64,
    pub veto_reason: Option<String>,
    pub veto_applied: bool,
    pub risk_score: f64,
    pub kelly_fraction: f64,
    pub breakdown: Vec<SignalContribution>,
    pub rejected: Vec<RejectedSignal>,
}

impl Verdict {
    fn base(direction: Decision, rejected: Vec<RejectedSignal>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            confidence: 0.0,
            log_odds: 0.0,
            fused_odds: 1.0,
            signals_used: 0,
            signals_rejected: rejected.len(),
            veto_applied: false,
            veto_reason: None,
            circuit_breaker: false,
            risk_score: 0.0,
            kelly_fraction: 0.0,
            position_size: 0.0,
            risk_report: None,
            risk_override: None,
            recommendation: None,
            breakdown: Vec::new(),
            rejected,
            created_at: chrono::Utc::now().to_rfc3339(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    /// HOLD verdict produced when the circuit breaker is active.
    pub fn circuit_breaker(rejected: Vec<RejectedSignal>) -> Self {
        Self {
            circuit_breaker: true,
            risk_score: 100.0,
            ..Self::base(Decision::Hold, rejected)
        }
    }

    /// HOLD verdict produced when too few signals were accepted.
    pub fn insufficient_signals(
        used: usize,
        required: usize,
        rejected: Vec<RejectedSignal>,
    ) -> Self {
        Self {
            signals_used: used,
            veto_reason: Some(format!("Insufficient signals: {used} < {required}")),
            risk_score: 50.0,
            ..Self::base(Decision::Hold, rejected)
        }
    }

    pub(crate) fn fused(parts: FusedParts) -> Self {
        let fused_odds = if parts.log_odds.abs() < 500.0 {
            parts.log_odds.exp()
        } else {
            f64::INFINITY
        };
        Self {
            confidence: parts.confidence,
            log_odds: parts.log_odds,
            fused_odds,
            signals_used: parts.breakdown.len(),
            veto_applied: parts.veto_applied,
            veto_reason: parts.veto_reason,
            risk_score: parts.risk_score,
            kelly_fraction: parts.kelly_fraction,
            position_size: parts.kelly_fraction,
            breakdown: parts.breakdown,
            ..Self::base(parts.direction, parts.rejected)
        }
    }

    /// Attach a Monte Carlo risk report, capping the stake at the smaller of
    /// the confidence-based and simulation-based Kelly fractions.
    pub fn with_risk_report(self, report: RiskReport) -> Self {
        let position_size = combine_stakes(self.kelly_fraction, report.mc_kelly_fraction);
        let risk_override = RiskOverride::from_var_95(report.var_95);
        Self {
            position_size,
            risk_override: Some(risk_override),
            risk_report: Some(report),
            ..self
        }
    }

    pub fn with_recommendation(self, recommendation: Recommendation) -> Self {
        Self {
            recommendation: Some(recommendation),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_verdict_is_fully_blocked() {
        let v = Verdict::circuit_breaker(vec![RejectedSignal {
            source_id: "sentiment".into(),
            reason: "circuit breaker active".into(),
        }]);
        assert_eq!(v.direction, Decision::Hold);
        assert!(v.circuit_breaker);
        assert_eq!(v.confidence, 0.0);
        assert_eq!(v.risk_score, 100.0);
        assert_eq!(v.position_size, 0.0);
        assert_eq!(v.signals_used, 0);
        assert_eq!(v.signals_rejected, 1);
        assert_eq!(v.fused_odds, 1.0);
    }

    #[test]
    fn insufficient_verdict_explains_itself() {
        let v = Verdict::insufficient_signals(1, 2, Vec::new());
        assert_eq!(v.direction, Decision::Hold);
        assert!(!v.circuit_breaker);
        assert!(!v.veto_applied);
        assert_eq!(v.risk_score, 50.0);
        assert_eq!(v.veto_reason.as_deref(), Some("Insufficient signals: 1 < 2"));
    }

    #[test]
    fn verdict_ids_are_unique() {
        let a = Verdict::insufficient_signals(0, 2, Vec::new());
        let b = Verdict::insufficient_signals(0, 2, Vec::new());
        assert_ne!(a.id, b.id);
    }
}
