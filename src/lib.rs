// =============================================================================
// Fusion Oracle — Bayesian signal fusion and risk gating
// =============================================================================
//
// Library core: pure computation plus the one piece of shared state
// (`RiskGuard`). The service binary in `main.rs` wraps it with HTTP,
// persistence and period rollover.
// =============================================================================

pub mod conditions;
pub mod config;
pub mod engine;
pub mod errors;
pub mod monte_carlo;
pub mod recommendation;
pub mod reflection;
pub mod risk;
pub mod signals;
pub mod sizing;
pub mod technical;
pub mod types;
pub mod verdict;

pub use config::EngineConfig;
pub use engine::{DecisionEngine, MarketContext};
pub use errors::{EngineError, EngineResult};
pub use monte_carlo::{CancelToken, MonteCarloSimulator, RiskOverride, RiskReport};
pub use reflection::{ReflectionEngine, ReflectionSnapshot, SettledRecord};
pub use risk::{RiskGuard, RiskState, SettlementReceipt};
pub use signals::FusionEngine;
pub use types::{Decision, Direction, Signal};
pub use verdict::Verdict;
