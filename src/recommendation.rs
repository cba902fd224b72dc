// =============================================================================
// Recommendation — advisory synthesis of fusion, TA consensus and risk
// =============================================================================
//
// The fused verdict is compared with the technical-analysis consensus:
//
//   STRONG    both point the same way           -> keep the verdict direction
//   WEAK      verdict HOLD or TA NEUTRAL        -> take whichever side is set
//   CONFLICT  opposite sides                    -> sit out (HOLD)
//
// The simulation report contributes the VaR-based risk override and the
// path win rate. The recommendation never changes the verdict itself.
// =============================================================================

use serde::Serialize;

use crate::monte_carlo::{RiskOverride, RiskReport};
use crate::technical::TechnicalAnalysis;
use crate::types::{Decision, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Agreement {
    Strong,
    Weak,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub final_direction: Decision,
    pub agreement: Agreement,
    pub risk_override: RiskOverride,
    pub var_95: f64,
    /// Share of simulated paths that ended in profit.
    pub win_probability: f64,
    pub rationale: String,
    pub technical: TechnicalAnalysis,
}

/// Combine the verdict stance, TA consensus and simulation into one
/// advisory call.
pub fn synthesize(
    direction: Decision,
    confidence: f64,
    technical: TechnicalAnalysis,
    report: &RiskReport,
) -> Recommendation {
    let ta = technical.consensus;
    let (agreement, final_direction) = match (direction, ta) {
        (Decision::Long, Direction::Long) | (Decision::Short, Direction::Short) => {
            (Agreement::Strong, direction)
        }
        (Decision::Hold, _) => (Agreement::Weak, Decision::from(ta)),
        (_, Direction::Neutral) => (Agreement::Weak, direction),
        _ => (Agreement::Conflict, Decision::Hold),
    };

    let rationale = format!(
        "Fusion={direction}(conf:{:.2}%), TA={ta}(conf:{:.2}%), MC VaR95={:.2}%, WinRate={:.1}%",
        confidence * 100.0,
        technical.confidence * 100.0,
        report.var_95 * 100.0,
        report.win_rate * 100.0,
    );

    Recommendation {
        final_direction,
        agreement,
        risk_override: RiskOverride::from_var_95(report.var_95),
        var_95: report.var_95,
        win_probability: report.win_rate,
        rationale,
        technical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(var_95: f64, win_rate: f64) -> RiskReport {
        RiskReport {
            var_95,
            var_99: var_95,
            cvar_95: var_95,
            sharpe_ratio: 0.0,
            expected_return: 0.0,
            volatility: 0.0,
            win_rate,
            avg_max_drawdown: 0.0,
            mc_kelly_fraction: 0.0,
            simulations: 1,
            steps: 6,
            step_minutes: 10,
            seed: 0,
        }
    }

    fn ta(consensus: Direction, confidence: f64) -> TechnicalAnalysis {
        TechnicalAnalysis {
            consensus,
            confidence,
            ..TechnicalAnalysis::from_closes(&[])
        }
    }

    #[test]
    fn matching_sides_are_strong() {
        let r = synthesize(Decision::Long, 0.6, ta(Direction::Long, 1.0), &report(0.005, 0.55));
        assert_eq!(r.agreement, Agreement::Strong);
        assert_eq!(r.final_direction, Decision::Long);
        assert_eq!(r.risk_override, RiskOverride::Clear);
        assert!((r.win_probability - 0.55).abs() < f64::EPSILON);
    }

    #[test]
    fn opposite_sides_conflict_to_hold() {
        let r = synthesize(Decision::Short, 0.7, ta(Direction::Long, 0.5), &report(0.025, 0.4));
        assert_eq!(r.agreement, Agreement::Conflict);
        assert_eq!(r.final_direction, Decision::Hold);
        assert_eq!(r.risk_override, RiskOverride::HighRiskReduce);
    }

    #[test]
    fn neutral_ta_or_hold_verdict_is_weak() {
        let r = synthesize(Decision::Short, 0.6, ta(Direction::Neutral, 0.0), &report(0.015, 0.5));
        assert_eq!(r.agreement, Agreement::Weak);
        assert_eq!(r.final_direction, Decision::Short);
        assert_eq!(r.risk_override, RiskOverride::Moderate);

        let r = synthesize(Decision::Hold, 0.5, ta(Direction::Short, 1.0), &report(0.0, 0.0));
        assert_eq!(r.agreement, Agreement::Weak);
        assert_eq!(r.final_direction, Decision::Short);

        let r = synthesize(Decision::Hold, 0.5, ta(Direction::Neutral, 0.0), &report(0.0, 0.0));
        assert_eq!(r.agreement, Agreement::Weak);
        assert_eq!(r.final_direction, Decision::Hold);
    }

    #[test]
    fn rationale_reports_percentages() {
        let r = synthesize(Decision::Long, 0.5755, ta(Direction::Long, 0.5), &report(0.0123, 0.512));
        assert_eq!(
            r.rationale,
            "Fusion=LONG(conf:57.55%), TA=LONG(conf:50.00%), MC VaR95=1.23%, WinRate=51.2%"
        );
    }
}
