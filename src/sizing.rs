// =============================================================================
// Kelly Position Sizer — fractional Kelly stake from fused confidence
// =============================================================================
//
// For an even-odds binary bet the full Kelly fraction is the edge over a coin
// flip divided by 0.5. The sizer applies a Kelly multiplier (quarter-Kelly by
// default) and hard-caps the result.
// =============================================================================

use crate::config::SizingParams;
use crate::types::Decision;

#[derive(Debug, Clone)]
pub struct PositionSizer {
    kelly_fraction: f64,
    max_position: f64,
}

impl PositionSizer {
    pub fn new(params: &SizingParams) -> Self {
        Self {
            kelly_fraction: params.kelly_fraction,
            max_position: params.max_position,
        }
    }

    /// Stake fraction for the post-veto `direction` at `confidence`.
    ///
    /// Zero for HOLD and for any confidence at or below 0.5.
    pub fn size(&self, direction: Decision, confidence: f64) -> f64 {
        if !direction.is_actionable() || !(confidence > 0.5) {
            return 0.0;
        }
        let edge = confidence - 0.5;
        let full_kelly = edge / 0.5;
        (full_kelly * self.kelly_fraction).clamp(0.0, self.max_position)
    }

    pub fn max_position(&self) -> f64 {
        self.max_position
    }
}

/// Final stake when a simulation-based cap is available.
pub fn combine_stakes(kelly_fraction: f64, mc_kelly_fraction: f64) -> f64 {
    kelly_fraction.min(mc_kelly_fraction).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> PositionSizer {
        PositionSizer::new(&SizingParams::default())
    }

    #[test]
    fn stake_is_bounded_for_every_confidence() {
        let s = sizer();
        for i in 0..=1000 {
            let c = i as f64 / 1000.0;
            for d in [Decision::Long, Decision::Short, Decision::Hold] {
                let k = s.size(d, c);
                assert!((0.0..=0.25).contains(&k), "size {k} at c={c}");
            }
        }
    }

    #[test]
    fn hold_and_coin_flip_get_nothing() {
        let s = sizer();
        assert_eq!(s.size(Decision::Hold, 0.9), 0.0);
        assert_eq!(s.size(Decision::Long, 0.5), 0.0);
        assert_eq!(s.size(Decision::Short, f64::NAN), 0.0);
    }

    #[test]
    fn quarter_kelly_values() {
        let s = sizer();
        assert!((s.size(Decision::Long, 0.6) - 0.05).abs() < 1e-12);
        assert!((s.size(Decision::Short, 0.75) - 0.125).abs() < 1e-12);
        assert!((s.size(Decision::Long, 1.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn cap_applies_when_tighter_than_kelly() {
        let s = PositionSizer::new(&SizingParams {
            kelly_fraction: 0.5,
            max_position: 0.1,
        });
        assert!((s.size(Decision::Long, 0.8) - 0.1).abs() < f64::EPSILON);
        assert!((s.max_position() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn combined_stake_takes_the_smaller() {
        assert!((combine_stakes(0.05, 0.02) - 0.02).abs() < f64::EPSILON);
        assert!((combine_stakes(0.05, 0.25) - 0.05).abs() < f64::EPSILON);
        assert_eq!(combine_stakes(0.05, -0.1), 0.0);
    }
}
