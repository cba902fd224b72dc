// =============================================================================
// Veto Gate — demote low-conviction calls to HOLD
// =============================================================================

use crate::types::Decision;

/// Direction after the veto gate, with the reason when it fired.
#[derive(Debug, Clone, PartialEq)]
pub struct VetoOutcome {
    pub direction: Decision,
    pub applied: bool,
    pub reason: Option<String>,
}

/// Force HOLD when `raw_confidence` is strictly below `threshold`.
///
/// A confidence exactly at the threshold passes. A raw HOLD (fused
/// probability of exactly 0.5) sits below any sane threshold and is reported
/// as vetoed.
pub fn apply_veto(raw_direction: Decision, raw_confidence: f64, threshold: f64) -> VetoOutcome {
    if raw_confidence < threshold {
        return VetoOutcome {
            direction: Decision::Hold,
            applied: true,
            reason: Some(format!(
                "Confidence {raw_confidence:.4} < veto threshold {threshold}"
            )),
        };
    }

    VetoOutcome {
        direction: raw_direction,
        applied: false,
        reason: None,
    }
}
