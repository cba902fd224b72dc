// =============================================================================
// Monte Carlo Risk Simulator — GBM path simulation for tail-risk metrics
// =============================================================================
//
// Each path walks `n_steps` geometric Brownian motion increments from the
// current price:
//
//     price *= exp((mu - sigma^2 / 2) * dt + sigma * sqrt(dt) * Z),  dt = 1
//
// and records the final return (negated for SHORT) plus the path's maximum
// drawdown from its running peak. The distribution of final returns yields
// VaR, CVaR, Sharpe, win rate and a simulation-based Kelly cap.
//
// Paths run in parallel on rayon. Every path owns an RNG stream derived from
// the master seed and its index, so a fixed seed reproduces the report
// exactly regardless of thread scheduling.
//
// All outputs are fractions: 0.01 means 1 %.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MonteCarloParams, SizingParams};
use crate::errors::{EngineError, EngineResult};
use crate::types::Direction;

/// Per-step volatility assumed when the price history is too short.
pub const DEFAULT_VOLATILITY: f64 = 0.02;

/// Steps between cancellation polls inside one path.
const CANCEL_POLL_STEPS: usize = 1024;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Tail-risk summary of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    /// Loss not exceeded in 95 % of paths.
    pub var_95: f64,
    pub var_99: f64,
    /// Mean loss across the worst 5 % of paths.
    pub cvar_95: f64,
    /// Annualised mean/std of final returns.
    pub sharpe_ratio: f64,
    pub expected_return: f64,
    /// Population std of final returns.
    pub volatility: f64,
    pub win_rate: f64,
    pub avg_max_drawdown: f64,
    pub mc_kelly_fraction: f64,
    pub simulations: usize,
    pub steps: usize,
    pub step_minutes: u32,
    /// Master seed actually used; replaying it reproduces this report.
    pub seed: u64,
}

/// Stake guidance derived from the 95 % VaR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskOverride {
    Clear,
    Moderate,
    HighRiskReduce,
}

impl RiskOverride {
    pub fn from_var_95(var_95: f64) -> Self {
        if var_95 > 0.02 {
            Self::HighRiskReduce
        } else if var_95 > 0.01 {
            Self::Moderate
        } else {
            Self::Clear
        }
    }
}

impl std::fmt::Display for RiskOverride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clear => write!(f, "CLEAR"),
            Self::Moderate => write!(f, "MODERATE"),
            Self::HighRiskReduce => write!(f, "HIGH_RISK_REDUCE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation hook, polled before each path and every
/// `CANCEL_POLL_STEPS` steps within it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

struct PathOutcome {
    final_return: f64,
    max_drawdown: f64,
}

#[derive(Debug, Clone)]
pub struct MonteCarloSimulator {
    params: MonteCarloParams,
    kelly_fraction: f64,
    max_position: f64,
}

impl MonteCarloSimulator {
    pub fn new(params: MonteCarloParams, sizing: &SizingParams) -> Self {
        Self {
            params,
            kelly_fraction: sizing.kelly_fraction,
            max_position: sizing.max_position,
        }
    }

    pub fn params(&self) -> &MonteCarloParams {
        &self.params
    }

    /// Simulate without a cancellation hook.
    pub fn simulate(
        &self,
        current_price: f64,
        mu: f64,
        sigma: f64,
        direction: Direction,
    ) -> EngineResult<RiskReport> {
        self.simulate_with_cancel(current_price, mu, sigma, direction, &CancelToken::new())
    }

    /// Simulate `n_simulations` paths and summarise the return distribution.
    ///
    /// Returns are measured for a long position unless `direction` is SHORT.
    pub fn simulate_with_cancel(
        &self,
        current_price: f64,
        mu: f64,
        sigma: f64,
        direction: Direction,
        cancel: &CancelToken,
    ) -> EngineResult<RiskReport> {
        if let Err(e) = self.validate(current_price, mu, sigma) {
            warn!(error = %e, "monte carlo run rejected");
            return Err(e);
        }

        let n = self.params.n_simulations;
        let steps = self.params.n_steps;
        let master_seed = self.params.seed.unwrap_or_else(rand::random::<u64>);
        let short = direction == Direction::Short;

        let started = Instant::now();
        let completed = AtomicUsize::new(0);
        let outcomes: Option<Vec<PathOutcome>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(path_seed(master_seed, i as u64));
                let outcome =
                    simulate_path(&mut rng, current_price, mu, sigma, steps, short, cancel)?;
                completed.fetch_add(1, Ordering::Relaxed);
                Some(outcome)
            })
            .collect();

        let Some(outcomes) = outcomes else {
            let completed = completed.load(Ordering::Relaxed);
            warn!(
                completed,
                requested = n,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "monte carlo run cancelled"
            );
            return Err(EngineError::SimulationCancelled {
                completed,
                requested: n,
            });
        };

        let mut returns = Vec::with_capacity(n);
        let mut drawdown_sum = 0.0;
        for o in outcomes {
            returns.push(o.final_return);
            drawdown_sum += o.max_drawdown;
        }

        let report = self.summarise(returns, drawdown_sum, master_seed);
        info!(
            simulations = n,
            steps,
            sigma,
            mu,
            var_95 = report.var_95,
            cvar_95 = report.cvar_95,
            mc_kelly = report.mc_kelly_fraction,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "monte carlo run complete"
        );
        Ok(report)
    }

    fn validate(&self, current_price: f64, mu: f64, sigma: f64) -> EngineResult<()> {
        let p = &self.params;
        if p.n_simulations == 0 {
            return Err(EngineError::SimulationConfig {
                field: "n_simulations",
                value: 0.0,
            });
        }
        if p.n_simulations > p.max_simulations {
            return Err(EngineError::SimulationConfig {
                field: "n_simulations",
                value: p.n_simulations as f64,
            });
        }
        if p.n_steps == 0 || p.n_steps > p.max_steps {
            return Err(EngineError::SimulationConfig {
                field: "n_steps",
                value: p.n_steps as f64,
            });
        }
        if p.step_minutes == 0 {
            return Err(EngineError::SimulationConfig {
                field: "step_minutes",
                value: 0.0,
            });
        }
        if !(current_price.is_finite() && current_price > 0.0) {
            return Err(EngineError::SimulationConfig {
                field: "current_price",
                value: current_price,
            });
        }
        if !mu.is_finite() {
            return Err(EngineError::SimulationConfig {
                field: "mu",
                value: mu,
            });
        }
        if !(sigma.is_finite() && sigma >= 0.0) {
            return Err(EngineError::SimulationConfig {
                field: "sigma",
                value: sigma,
            });
        }
        Ok(())
    }

    fn summarise(&self, mut returns: Vec<f64>, drawdown_sum: f64, seed: u64) -> RiskReport {
        let n = returns.len();
        let nf = n as f64;

        let mean = returns.iter().sum::<f64>() / nf;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / nf;
        let std = variance.sqrt();
        let wins = returns.iter().filter(|r| **r > 0.0).count();

        returns.sort_by(|a, b| a.total_cmp(b));
        let idx_95 = ((nf * 0.05) as usize).min(n - 1);
        let idx_99 = ((nf * 0.01) as usize).min(n - 1);
        let var_95 = -returns[idx_95];
        let var_99 = -returns[idx_99];

        let tail = &returns[..idx_95];
        let cvar_95 = if tail.is_empty() {
            var_95
        } else {
            -(tail.iter().sum::<f64>() / tail.len() as f64)
        };

        let sharpe_ratio = if std > 0.0 {
            mean / std * self.params.periods_per_year().sqrt()
        } else {
            0.0
        };

        let mc_kelly_fraction = if variance > 0.0 {
            (mean / variance * self.kelly_fraction).clamp(0.0, self.max_position)
        } else {
            0.0
        };

        debug!(mean, std, wins, "return distribution summarised");

        RiskReport {
            var_95,
            var_99,
            cvar_95,
            sharpe_ratio,
            expected_return: mean,
            volatility: std,
            win_rate: wins as f64 / nf,
            avg_max_drawdown: drawdown_sum / nf,
            mc_kelly_fraction,
            simulations: n,
            steps: self.params.n_steps,
            step_minutes: self.params.step_minutes,
            seed,
        }
    }
}

fn simulate_path(
    rng: &mut StdRng,
    start: f64,
    mu: f64,
    sigma: f64,
    steps: usize,
    short: bool,
    cancel: &CancelToken,
) -> Option<PathOutcome> {
    let drift = mu - 0.5 * sigma * sigma;
    let mut price = start;
    let mut peak = start;
    let mut max_drawdown: f64 = 0.0;

    for step in 0..steps {
        if step % CANCEL_POLL_STEPS == 0 && cancel.is_cancelled() {
            return None;
        }
        let z: f64 = StandardNormal.sample(rng);
        price *= (drift + sigma * z).exp();
        if price > peak {
            peak = price;
        }
        max_drawdown = max_drawdown.max((peak - price) / peak);
    }

    let ret = (price - start) / start;
    Some(PathOutcome {
        final_return: if short { -ret } else { ret },
        max_drawdown,
    })
}

/// Independent per-path seed: splitmix64 finaliser over `master ^ index`.
fn path_seed(master: u64, index: u64) -> u64 {
    let mut z = (master ^ index).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// Volatility estimate
// ---------------------------------------------------------------------------

/// Sample standard deviation of log-returns between consecutive positive
/// prices. Falls back to `DEFAULT_VOLATILITY` with fewer than two returns.
pub fn estimate_volatility(prices: &[f64]) -> f64 {
    let log_returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0 && w[0].is_finite() && w[1].is_finite())
        .map(|w| (w[1] / w[0]).ln())
        .collect();

    if log_returns.len() < 2 {
        return DEFAULT_VOLATILITY;
    }

    let n = log_returns.len() as f64;
    let mean = log_returns.iter().sum::<f64>() / n;
    let var = log_returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}
