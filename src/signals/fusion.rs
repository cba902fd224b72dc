// =============================================================================
// Bayesian Fusion Engine — log-odds aggregation of independent signals
// =============================================================================
//
// Each accepted signal contributes `weight * ln(LR)` to a running log-odds
// total, where LR = c / (1 - c) for its clamped confidence c (inverted for
// SHORT). The total passes through a logistic function to give the fused
// probability of LONG. Working in log space keeps the product of many
// likelihood ratios from overflowing.
//
// Gate order inside `fuse` is fixed: circuit breaker, minimum signal count,
// raw fusion, veto, sizing.
// =============================================================================

use tracing::{debug, info, warn};

use crate::config::{FusionParams, SizingParams};
use crate::risk::RiskState;
use crate::signals::veto::apply_veto;
use crate::sizing::PositionSizer;
use crate::types::{Decision, Direction, Signal};
use crate::verdict::{FusedParts, RejectedSignal, SignalContribution, Verdict};

/// Confidence bounds applied before computing a likelihood ratio.
const CONFIDENCE_FLOOR: f64 = 0.501;
const CONFIDENCE_CEIL: f64 = 0.999;

pub const BREAKER_REJECTION: &str = "circuit breaker active";

/// Collects one cycle's signals and fuses them into a verdict.
///
/// An engine is built fresh for every cycle; `reset` clears it for reuse.
pub struct FusionEngine {
    params: FusionParams,
    sizer: PositionSizer,
    accepted: Vec<Signal>,
    rejected: Vec<RejectedSignal>,
}

impl FusionEngine {
    pub fn new(params: FusionParams, sizing: &SizingParams) -> Self {
        Self {
            params,
            sizer: PositionSizer::new(sizing),
            accepted: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Accept or reject one signal. Returns `true` when accepted.
    ///
    /// Rejections are recorded with a reason and never raise.
    pub fn ingest(&mut self, signal: Signal) -> bool {
        let reason = if !self.params.roster.contains_key(signal.source_id()) {
            Some(format!("Unknown source: {}", signal.source_id()))
        } else if signal.confidence() < self.params.min_confidence_input {
            Some(format!(
                "Confidence {:.3} below minimum {}",
                signal.confidence(),
                self.params.min_confidence_input
            ))
        } else if signal.direction() == Direction::Neutral {
            Some("Neutral signals carry no directional evidence".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(source = signal.source_id(), %reason, "signal rejected");
                self.rejected.push(RejectedSignal {
                    source_id: signal.source_id().to_string(),
                    reason,
                });
                false
            }
            None => {
                debug!(
                    source = signal.source_id(),
                    direction = %signal.direction(),
                    confidence = signal.confidence(),
                    "signal accepted"
                );
                self.accepted.push(signal);
                true
            }
        }
    }

    /// Record `signal` as rejected without evaluating it.
    pub fn reject(&mut self, signal: &Signal, reason: impl Into<String>) {
        self.rejected.push(RejectedSignal {
            source_id: signal.source_id().to_string(),
            reason: reason.into(),
        });
    }

    pub fn accepted(&self) -> &[Signal] {
        &self.accepted
    }

    pub fn rejected(&self) -> &[RejectedSignal] {
        &self.rejected
    }

    pub fn reset(&mut self) {
        self.accepted.clear();
        self.rejected.clear();
    }

    /// Fuse the accepted signals into a verdict under the given risk state.
    pub fn fuse(&self, risk: &RiskState) -> Verdict {
        if risk.is_breaker_triggered() {
            warn!(
                cumulative_pnl = risk.cumulative_pnl_percent,
                consecutive_losses = risk.consecutive_losses,
                "circuit breaker active, forcing HOLD"
            );
            let mut rejected = self.rejected.clone();
            rejected.extend(self.accepted.iter().map(|s| RejectedSignal {
                source_id: s.source_id().to_string(),
                reason: BREAKER_REJECTION.to_string(),
            }));
            return Verdict::circuit_breaker(rejected);
        }

        if self.accepted.len() < self.params.min_signals {
            info!(
                accepted = self.accepted.len(),
                required = self.params.min_signals,
                "insufficient signals, holding"
            );
            return Verdict::insufficient_signals(
                self.accepted.len(),
                self.params.min_signals,
                self.rejected.clone(),
            );
        }

        let (log_odds, breakdown) = fuse_log_odds(&self.accepted);
        let (raw_direction, raw_confidence) = raw_stance(sigmoid(log_odds));

        let veto = apply_veto(raw_direction, raw_confidence, self.params.veto_threshold);
        if veto.applied {
            warn!(
                raw_direction = %raw_direction,
                confidence = raw_confidence,
                threshold = self.params.veto_threshold,
                "veto gate fired, forcing HOLD"
            );
        }
        let kelly_fraction = self.sizer.size(veto.direction, raw_confidence);
        let risk_score = risk_score(
            raw_confidence,
            has_conflict(&self.accepted),
            risk.cumulative_pnl_percent,
        );

        info!(
            direction = %veto.direction,
            raw_direction = %raw_direction,
            confidence = raw_confidence,
            log_odds,
            veto = veto.applied,
            kelly = kelly_fraction,
            risk_score,
            "signals fused"
        );

        Verdict::fused(FusedParts {
            direction: veto.direction,
            confidence: raw_confidence,
            log_odds,
            veto_reason: veto.reason,
            veto_applied: veto.applied,
            risk_score,
            kelly_fraction,
            breakdown,
            rejected: self.rejected.clone(),
        })
    }
}

// =============================================================================
// Math
// =============================================================================

/// Likelihood ratio of one signal, already oriented towards LONG.
pub fn likelihood_ratio(direction: Direction, confidence: f64) -> f64 {
    let c = confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL);
    let lr = c / (1.0 - c);
    match direction {
        Direction::Short => 1.0 / lr,
        _ => lr,
    }
}

/// Sum of weighted log-likelihood ratios with the per-signal breakdown.
pub fn fuse_log_odds(signals: &[Signal]) -> (f64, Vec<SignalContribution>) {
    let mut log_odds = 0.0;
    let mut breakdown = Vec::with_capacity(signals.len());

    for signal in signals {
        let lr = likelihood_ratio(signal.direction(), signal.confidence());
        let weighted_log_lr = signal.weight() * lr.ln();
        log_odds += weighted_log_lr;

        breakdown.push(SignalContribution {
            source_id: signal.source_id().to_string(),
            direction: signal.direction(),
            confidence: signal.confidence(),
            weight: signal.weight(),
            likelihood_ratio: lr,
            weighted_log_lr,
            reasoning: signal.reasoning().to_string(),
        });
    }

    (log_odds, breakdown)
}

/// Logistic function, evaluated without overflow for large |x|.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Direction and confidence implied by a probability of LONG.
pub fn raw_stance(p_long: f64) -> (Decision, f64) {
    if p_long > 0.5 {
        (Decision::Long, p_long)
    } else if p_long < 0.5 {
        (Decision::Short, 1.0 - p_long)
    } else {
        (Decision::Hold, 0.5)
    }
}

fn has_conflict(signals: &[Signal]) -> bool {
    let long = signals.iter().any(|s| s.direction() == Direction::Long);
    let short = signals.iter().any(|s| s.direction() == Direction::Short);
    long && short
}

/// Composite 0–100 risk score: uncertainty, disagreement and recent losses.
pub fn risk_score(raw_confidence: f64, conflicting: bool, cumulative_pnl_percent: f64) -> f64 {
    let uncertainty = (1.0 - raw_confidence) * 60.0;
    let conflict = if conflicting { 20.0 } else { 0.0 };
    let pnl = (cumulative_pnl_percent.abs() * 10.0).min(20.0);
    (uncertainty + conflict + pnl).min(100.0)
}
