// =============================================================================
// Signals Module
// =============================================================================
//
// Signal aggregation pipeline for the decision engine:
// - Bayesian log-odds fusion of independent source signals
// - Veto gate demoting low-confidence calls to HOLD

pub mod fusion;
pub mod veto;

pub use fusion::{fuse_log_odds, likelihood_ratio, risk_score, sigmoid, FusionEngine};
pub use veto::{apply_veto, VetoOutcome};
