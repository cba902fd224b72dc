use thiserror::Error;

/// Typed error hierarchy for the fusion core.
///
/// Data conditions (rejected signals, too few signals, a tripped breaker) are
/// not errors; they produce HOLD verdicts. Only caller or configuration misuse
/// surfaces here. Binary code wraps these with `anyhow::Context`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    // -- Signals ------------------------------------------------------------
    #[error("invalid signal: {reason}")]
    InvalidSignal { reason: String },

    // -- Monte Carlo --------------------------------------------------------
    #[error("invalid simulation parameter {field} = {value}")]
    SimulationConfig { field: &'static str, value: f64 },

    #[error("simulation cancelled after {completed}/{requested} paths")]
    SimulationCancelled { completed: usize, requested: usize },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
