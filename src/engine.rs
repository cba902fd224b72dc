// =============================================================================
// Decision Engine — one full fusion cycle
// =============================================================================
//
// Signals -> breaker check -> fusion -> veto -> Kelly sizing, then, when a
// market context is supplied and the verdict is actionable, a Monte Carlo run
// caps the stake at the simulation-based Kelly fraction.
//
// The engine holds only immutable configuration. The shared `RiskGuard` is
// passed in by the caller on every cycle.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conditions::MarketConditions;
use crate::config::EngineConfig;
use crate::errors::EngineResult;
use crate::monte_carlo::{estimate_volatility, CancelToken, MonteCarloSimulator};
use crate::recommendation::synthesize;
use crate::risk::RiskGuard;
use crate::signals::fusion::{FusionEngine, BREAKER_REJECTION};
use crate::technical::TechnicalAnalysis;
use crate::types::{Decision, Direction, Signal};
use crate::verdict::Verdict;

/// Price data used to refine an actionable verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub current_price: f64,
    /// Recent closes, oldest first.
    #[serde(default)]
    pub price_history: Vec<f64>,
}

impl MarketContext {
    pub fn conditions(&self, config: &EngineConfig) -> MarketConditions {
        MarketConditions::from_prices(&self.price_history, &config.conditions)
    }
}

pub struct DecisionEngine {
    config: EngineConfig,
    simulator: MonteCarloSimulator,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let simulator = MonteCarloSimulator::new(config.monte_carlo.clone(), &config.sizing);
        Ok(Self { config, simulator })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn simulator(&self) -> &MonteCarloSimulator {
        &self.simulator
    }

    /// Fresh fusion engine for one cycle.
    pub fn fusion_engine(&self) -> FusionEngine {
        FusionEngine::new(self.config.fusion.clone(), &self.config.sizing)
    }

    pub fn run_cycle(
        &self,
        risk: &RiskGuard,
        signals: Vec<Signal>,
        market: Option<&MarketContext>,
    ) -> EngineResult<Verdict> {
        self.run_cycle_with_cancel(risk, signals, market, &CancelToken::new())
    }

    /// Run one cycle. Only the Monte Carlo refinement can fail.
    pub fn run_cycle_with_cancel(
        &self,
        risk: &RiskGuard,
        signals: Vec<Signal>,
        market: Option<&MarketContext>,
        cancel: &CancelToken,
    ) -> EngineResult<Verdict> {
        let state = risk.snapshot();
        let mut fusion = self.fusion_engine();

        if state.is_breaker_triggered() {
            for s in &signals {
                fusion.reject(s, BREAKER_REJECTION);
            }
        } else {
            for s in signals {
                fusion.ingest(s);
            }
        }

        let verdict = fusion.fuse(&state);

        match market {
            Some(m) if verdict.direction.is_actionable() => self.refine(verdict, m, cancel),
            _ => Ok(verdict),
        }
    }

    /// Attach a Monte Carlo risk report to an actionable verdict.
    pub fn refine(
        &self,
        verdict: Verdict,
        market: &MarketContext,
        cancel: &CancelToken,
    ) -> EngineResult<Verdict> {
        let direction = match verdict.direction {
            Decision::Long => Direction::Long,
            Decision::Short => Direction::Short,
            Decision::Hold => return Ok(verdict),
        };
        let drift = self.config.monte_carlo.drift;
        let mu = if direction == Direction::Long { drift } else { -drift };
        let sigma = estimate_volatility(&market.price_history);
        debug!(mu, sigma, price = market.current_price, "refining verdict");

        let report =
            self.simulator
                .simulate_with_cancel(market.current_price, mu, sigma, direction, cancel)?;

        let recommendation = synthesize(
            verdict.direction,
            verdict.confidence,
            TechnicalAnalysis::from_closes(&market.price_history),
            &report,
        );
        debug!(
            agreement = ?recommendation.agreement,
            final_direction = %recommendation.final_direction,
            "recommendation synthesised"
        );

        let refined = verdict
            .with_risk_report(report)
            .with_recommendation(recommendation);
        if refined.position_size < refined.kelly_fraction {
            warn!(
                kelly = refined.kelly_fraction,
                capped = refined.position_size,
                "stake capped by simulation"
            );
        }
        Ok(refined)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EngineError;
    use crate::monte_carlo::RiskOverride;
    use crate::recommendation::Agreement;

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.monte_carlo.n_simulations = 2_000;
        cfg.monte_carlo.seed = Some(2024);
        cfg
    }

    fn demo_signals() -> Vec<Signal> {
        vec![
            Signal::new("market_data", Direction::Long, 0.72, 0.25, "trend up"),
            Signal::new("sentiment", Direction::Long, 0.61, 0.15, "positive news"),
            Signal::new("anomaly", Direction::Short, 0.68, 0.15, "volume spike"),
            Signal::new("order_flow", Direction::Long, 0.58, 0.10, "bid pressure"),
            Signal::new("macro_regime", Direction::Long, 0.65, 0.10, "risk on"),
            Signal::new("volatility", Direction::Long, 0.55, 0.10, "contracting"),
        ]
    }

    fn market() -> MarketContext {
        MarketContext {
            current_price: 100.0,
            price_history: (0..40)
                .map(|i| 100.0 + if i % 2 == 0 { 0.0 } else { 0.3 })
                .collect(),
        }
    }

    #[test]
    fn cycle_without_market_is_pure_fusion() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();

        let v = engine.run_cycle(&risk, demo_signals(), None).unwrap();
        assert_eq!(v.direction, Decision::Long);
        assert!((v.confidence - 0.5755165076805636).abs() < 1e-12);
        assert!(v.risk_report.is_none());
        assert!(v.recommendation.is_none());
        assert!((v.position_size - v.kelly_fraction).abs() < f64::EPSILON);
    }

    #[test]
    fn market_context_refines_stake() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();

        let v = engine.run_cycle(&risk, demo_signals(), Some(&market())).unwrap();
        let report = v.risk_report.as_ref().unwrap();
        assert_eq!(report.simulations, 2_000);
        assert!(v.position_size <= v.kelly_fraction);
        assert!(
            (v.position_size - v.kelly_fraction.min(report.mc_kelly_fraction)).abs()
                < f64::EPSILON
        );
        assert_eq!(v.risk_override, Some(RiskOverride::from_var_95(report.var_95)));
    }

    #[test]
    fn refined_verdict_carries_strong_recommendation() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();

        // Alternating closes end on a bullish MACD flip inside a squeeze.
        let v = engine.run_cycle(&risk, demo_signals(), Some(&market())).unwrap();
        let rec = v.recommendation.as_ref().unwrap();
        assert_eq!(rec.technical.consensus, Direction::Long);
        assert_eq!(rec.agreement, Agreement::Strong);
        assert_eq!(rec.final_direction, Decision::Long);
        assert_eq!(Some(rec.risk_override), v.risk_override);
        let report = v.risk_report.as_ref().unwrap();
        assert_eq!(rec.win_probability, report.win_rate);
        assert!(rec.rationale.starts_with("Fusion=LONG(conf:57.55%), TA=LONG"));
    }

    #[test]
    fn conflicting_consensus_is_advisory_only() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();

        // Accelerating rally: overbought RSI and an upper band touch vote SHORT.
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + 0.05 * (i * i) as f64).collect();
        let m = MarketContext {
            current_price: closes[39],
            price_history: closes,
        };
        let v = engine.run_cycle(&risk, demo_signals(), Some(&m)).unwrap();
        let rec = v.recommendation.as_ref().unwrap();
        assert_eq!(rec.technical.consensus, Direction::Short);
        assert_eq!(rec.agreement, Agreement::Conflict);
        assert_eq!(rec.final_direction, Decision::Hold);

        assert_eq!(v.direction, Decision::Long);
        let report = v.risk_report.as_ref().unwrap();
        assert!(
            (v.position_size - v.kelly_fraction.min(report.mc_kelly_fraction)).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn refinement_is_reproducible_with_seed() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();
        let a = engine.run_cycle(&risk, demo_signals(), Some(&market())).unwrap();
        let b = engine.run_cycle(&risk, demo_signals(), Some(&market())).unwrap();
        assert_eq!(a.risk_report, b.risk_report);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn hold_verdicts_skip_simulation() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();
        let signals = vec![
            Signal::new("market_data", Direction::Long, 0.56, 0.1, ""),
            Signal::new("sentiment", Direction::Long, 0.56, 0.1, ""),
        ];
        let v = engine.run_cycle(&risk, signals, Some(&market())).unwrap();
        assert_eq!(v.direction, Decision::Hold);
        assert!(v.veto_applied);
        assert!(v.risk_report.is_none());
    }

    #[test]
    fn tripped_breaker_rejects_every_signal() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();

        let seed = engine.run_cycle(&risk, demo_signals(), None).unwrap();
        for _ in 0..5 {
            risk.settle(&seed, Direction::Short, -0.2);
        }
        assert!(risk.is_triggered());

        let v = engine.run_cycle(&risk, demo_signals(), Some(&market())).unwrap();
        assert!(v.circuit_breaker);
        assert_eq!(v.direction, Decision::Hold);
        assert_eq!(v.signals_used, 0);
        assert_eq!(v.signals_rejected, 6);
        assert!(v.risk_report.is_none());
    }

    #[test]
    fn cancelled_refinement_surfaces_error() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = engine
            .run_cycle_with_cancel(&risk, demo_signals(), Some(&market()), &token)
            .unwrap_err();
        assert!(matches!(err, EngineError::SimulationCancelled { .. }));
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut cfg = EngineConfig::default();
        cfg.fusion.veto_threshold = 1.5;
        assert!(matches!(
            DecisionEngine::new(cfg),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn bad_market_price_is_a_config_error() {
        let cfg = config();
        let risk = RiskGuard::new(&cfg.breaker);
        let engine = DecisionEngine::new(cfg).unwrap();
        let m = MarketContext {
            current_price: -1.0,
            price_history: Vec::new(),
        };
        let err = engine.run_cycle(&risk, demo_signals(), Some(&m)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SimulationConfig {
                field: "current_price",
                ..
            }
        ));
    }
}
