// =============================================================================
// Risk Guard — period circuit breaker protecting capital
// =============================================================================
//
// Two breakers share one state:
//   1. Drawdown           — trips when the period's cumulative PnL reaches
//                           minus the drawdown limit (in percent).
//   2. Consecutive Losses — trips after N consecutive losing verdicts.
//
// The state is mutated only by settlement and by explicit period resets.
// Callers roll the period themselves through `roll_period`; nothing resets
// as a side effect of a read.
// =============================================================================

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerParams;
use crate::types::{Decision, Direction};
use crate::verdict::Verdict;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a single circuit breaker for dashboard display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskMode {
    Normal,
    Cautious,
    #[serde(rename = "BREAKER_TRIPPED")]
    BreakerTripped,
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Cautious => write!(f, "Cautious"),
            Self::BreakerTripped => write!(f, "BREAKER_TRIPPED"),
        }
    }
}

/// Period-scoped loss accounting read by every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    /// Sum of settled PnL this period, in percent (-3.0 = 3 % loss).
    pub cumulative_pnl_percent: f64,
    pub consecutive_losses: u32,
    pub max_drawdown_limit: f64,
    pub max_consecutive_losses: u32,
    #[serde(default)]
    pub trades_this_period: u32,
    pub period: NaiveDate,
}

impl RiskState {
    pub fn new(params: &BreakerParams, period: NaiveDate) -> Self {
        Self {
            cumulative_pnl_percent: 0.0,
            consecutive_losses: 0,
            max_drawdown_limit: params.max_drawdown_limit,
            max_consecutive_losses: params.max_consecutive_losses,
            trades_this_period: 0,
            period,
        }
    }

    /// True iff either breaker is at or past its limit.
    pub fn is_breaker_triggered(&self) -> bool {
        self.cumulative_pnl_percent <= -self.max_drawdown_limit
            || self.consecutive_losses >= self.max_consecutive_losses
    }

    pub fn risk_mode(&self) -> RiskMode {
        if self.is_breaker_triggered() {
            RiskMode::BreakerTripped
        } else if -self.cumulative_pnl_percent >= self.max_drawdown_limit * 0.75
            || self.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75
        {
            RiskMode::Cautious
        } else {
            RiskMode::Normal
        }
    }

    pub fn circuit_breakers(&self) -> Vec<CircuitBreakerInfo> {
        vec![
            CircuitBreakerInfo {
                name: "Drawdown".to_string(),
                current: (-self.cumulative_pnl_percent).max(0.0),
                limit: self.max_drawdown_limit,
                tripped: self.cumulative_pnl_percent <= -self.max_drawdown_limit,
            },
            CircuitBreakerInfo {
                name: "Consecutive Losses".to_string(),
                current: self.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: self.consecutive_losses >= self.max_consecutive_losses,
            },
        ]
    }

    fn reset(&mut self, period: NaiveDate) {
        self.cumulative_pnl_percent = 0.0;
        self.consecutive_losses = 0;
        self.trades_this_period = 0;
        self.period = period;
    }
}

/// Free-function form of the breaker predicate.
pub fn is_triggered(state: &RiskState) -> bool {
    state.is_breaker_triggered()
}

/// Outcome of settling one verdict against the realized market move.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub verdict_id: String,
    pub verdict_direction: Decision,
    pub actual_outcome: Direction,
    pub pnl_percent: f64,
    /// A HOLD verdict never matches an outcome, so it settles as a miss.
    pub was_correct: bool,
    pub state: RiskState,
    pub breaker_triggered: bool,
    pub risk_mode: RiskMode,
}

// ---------------------------------------------------------------------------
// Risk Guard
// ---------------------------------------------------------------------------

/// Owner of the shared `RiskState`; the single writer is `settle`.
pub struct RiskGuard {
    state: RwLock<RiskState>,
}

impl RiskGuard {
    pub fn new(params: &BreakerParams) -> Self {
        let today = Utc::now().date_naive();
        info!(
            max_drawdown_limit = params.max_drawdown_limit,
            max_consecutive_losses = params.max_consecutive_losses,
            period = %today,
            "RiskGuard initialised"
        );
        Self::with_state(RiskState::new(params, today))
    }

    pub fn with_state(state: RiskState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Consistent copy of the current state.
    pub fn snapshot(&self) -> RiskState {
        self.state.read().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.state.read().is_breaker_triggered()
    }

    pub fn breaker_info(&self) -> Vec<CircuitBreakerInfo> {
        self.state.read().circuit_breakers()
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Apply one realized outcome to the period state.
    ///
    /// Every settled verdict counts as a period trade. HOLD matches no
    /// outcome and extends the loss streak. A non-finite `pnl_percent` is
    /// booked as zero.
    pub fn settle(
        &self,
        verdict: &Verdict,
        actual_outcome: Direction,
        pnl_percent: f64,
    ) -> SettlementReceipt {
        let was_correct = verdict.direction.matches(actual_outcome);
        let pnl = if pnl_percent.is_finite() {
            pnl_percent
        } else {
            warn!(verdict_id = %verdict.id, pnl_percent, "non-finite pnl booked as zero");
            0.0
        };

        let state = {
            let mut s = self.state.write();
            let was_triggered = s.is_breaker_triggered();
            s.cumulative_pnl_percent += pnl;
            s.trades_this_period += 1;
            if was_correct {
                s.consecutive_losses = 0;
            } else {
                s.consecutive_losses += 1;
            }
            if !was_triggered && s.is_breaker_triggered() {
                warn!(
                    cumulative_pnl = s.cumulative_pnl_percent,
                    consecutive_losses = s.consecutive_losses,
                    "circuit breaker tripped"
                );
            }
            s.clone()
        };

        info!(
            verdict_id = %verdict.id,
            direction = %verdict.direction,
            actual = %actual_outcome,
            pnl_percent = pnl,
            was_correct,
            cumulative_pnl = state.cumulative_pnl_percent,
            consecutive_losses = state.consecutive_losses,
            "verdict settled"
        );

        SettlementReceipt {
            verdict_id: verdict.id.clone(),
            verdict_direction: verdict.direction,
            actual_outcome,
            pnl_percent: pnl,
            was_correct,
            breaker_triggered: state.is_breaker_triggered(),
            risk_mode: state.risk_mode(),
            state,
        }
    }

    // -------------------------------------------------------------------------
    // Period reset
    // -------------------------------------------------------------------------

    /// Forcefully start a new period dated `period`.
    pub fn reset_period(&self, period: NaiveDate) {
        let mut s = self.state.write();
        s.reset(period);
        info!(period = %period, "risk period reset (manual)");
    }

    /// Start a new period if `today` differs from the current one.
    /// Returns `true` when a reset happened.
    pub fn roll_period(&self, today: NaiveDate) -> bool {
        {
            let s = self.state.read();
            if s.period == today {
                return false;
            }
        }
        let mut s = self.state.write();
        // Another caller may have rolled between the two locks.
        if s.period == today {
            return false;
        }
        info!(
            old_period = %s.period,
            new_period = %today,
            "period rolled, resetting risk counters"
        );
        s.reset(today);
        true
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskGuard")
            .field("period", &s.period)
            .field("cumulative_pnl_percent", &s.cumulative_pnl_percent)
            .field("consecutive_losses", &s.consecutive_losses)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn guard() -> RiskGuard {
        RiskGuard::with_state(RiskState::new(&BreakerParams::default(), day(1)))
    }

    fn verdict(direction: Decision) -> Verdict {
        let mut v = Verdict::insufficient_signals(0, 2, Vec::new());
        v.direction = direction;
        v
    }

    #[test]
    fn drawdown_limit_is_inclusive() {
        let mut s = RiskState::new(&BreakerParams::default(), day(1));
        s.cumulative_pnl_percent = -2.999;
        assert!(!is_triggered(&s));
        s.cumulative_pnl_percent = -3.0;
        assert!(is_triggered(&s));
    }

    #[test]
    fn consecutive_loss_limit_is_inclusive() {
        let mut s = RiskState::new(&BreakerParams::default(), day(1));
        s.consecutive_losses = 4;
        assert!(!s.is_breaker_triggered());
        s.consecutive_losses = 5;
        assert!(s.is_breaker_triggered());
    }

    #[test]
    fn losses_accumulate_and_wins_reset_streak() {
        let g = guard();
        for _ in 0..3 {
            let r = g.settle(&verdict(Decision::Long), Direction::Short, -0.4);
            assert!(!r.was_correct);
        }
        assert_eq!(g.snapshot().consecutive_losses, 3);

        let r = g.settle(&verdict(Decision::Short), Direction::Short, 0.5);
        assert!(r.was_correct);
        let s = g.snapshot();
        assert_eq!(s.consecutive_losses, 0);
        assert_eq!(s.trades_this_period, 4);
        assert!((s.cumulative_pnl_percent - (-0.7)).abs() < 1e-10);
    }

    #[test]
    fn five_straight_losses_trip_the_breaker() {
        let g = guard();
        let mut last = None;
        for _ in 0..5 {
            last = Some(g.settle(&verdict(Decision::Long), Direction::Short, -0.1));
        }
        let r = last.unwrap();
        assert!(r.breaker_triggered);
        assert_eq!(r.risk_mode, RiskMode::BreakerTripped);
        assert!(g.is_triggered());
    }

    #[test]
    fn hold_settles_as_a_counted_miss() {
        let g = guard();
        g.settle(&verdict(Decision::Long), Direction::Long, 0.3);
        let r = g.settle(&verdict(Decision::Hold), Direction::Long, -0.2);
        assert!(!r.was_correct);
        let s = g.snapshot();
        assert_eq!(s.trades_this_period, 2);
        assert_eq!(s.consecutive_losses, 1);
        assert!((s.cumulative_pnl_percent - 0.1).abs() < 1e-12);
    }

    #[test]
    fn repeated_holds_can_trip_the_breaker() {
        let g = guard();
        for _ in 0..5 {
            g.settle(&verdict(Decision::Hold), Direction::Short, 0.0);
        }
        assert!(g.is_triggered());
        assert_eq!(g.snapshot().consecutive_losses, 5);
    }

    #[test]
    fn roll_period_resets_only_on_new_date() {
        let g = guard();
        g.settle(&verdict(Decision::Long), Direction::Short, -3.5);
        assert!(g.is_triggered());

        assert!(!g.roll_period(day(1)));
        assert!(g.is_triggered());

        assert!(g.roll_period(day(2)));
        let s = g.snapshot();
        assert!(!s.is_breaker_triggered());
        assert_eq!(s.period, day(2));
        assert_eq!(s.trades_this_period, 0);
    }

    #[test]
    fn manual_reset_clears_counters() {
        let g = guard();
        g.settle(&verdict(Decision::Short), Direction::Long, -1.0);
        g.reset_period(day(1));
        let s = g.snapshot();
        assert_eq!(s.cumulative_pnl_percent, 0.0);
        assert_eq!(s.consecutive_losses, 0);
    }

    #[test]
    fn risk_mode_turns_cautious_at_three_quarters() {
        let mut s = RiskState::new(&BreakerParams::default(), day(1));
        assert_eq!(s.risk_mode(), RiskMode::Normal);
        s.cumulative_pnl_percent = -2.25;
        assert_eq!(s.risk_mode(), RiskMode::Cautious);
        s.cumulative_pnl_percent = 0.0;
        s.consecutive_losses = 4;
        assert_eq!(s.risk_mode(), RiskMode::Cautious);
    }

    #[test]
    fn breaker_info_reports_both_breakers() {
        let g = guard();
        g.settle(&verdict(Decision::Long), Direction::Short, -1.5);
        let info = g.breaker_info();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].name, "Drawdown");
        assert!((info[0].current - 1.5).abs() < 1e-10);
        assert!(!info[0].tripped);
        assert!((info[1].current - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn non_finite_pnl_is_booked_as_zero() {
        let g = guard();
        let r = g.settle(&verdict(Decision::Long), Direction::Long, f64::NAN);
        assert_eq!(r.pnl_percent, 0.0);
        assert_eq!(g.snapshot().cumulative_pnl_percent, 0.0);
    }
}
