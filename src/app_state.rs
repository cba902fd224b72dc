// =============================================================================
// Central Application State — Fusion Oracle service
// =============================================================================
//
// Ties the decision engine, the shared risk guard and the reflection engine
// together and provides a unified snapshot for the REST API and WebSocket
// feed.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the mutable collections.
//   - RiskGuard manages its own interior mutability.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use fusion_oracle::conditions::MarketConditions;
use fusion_oracle::reflection::{
    ReflectionEngine, ReflectionInsight, ReflectionSnapshot, RegimePattern, SettledRecord,
    ThresholdSuggestion, TrustRecord,
};
use fusion_oracle::risk::{CircuitBreakerInfo, RiskMode, RiskState, SettlementReceipt};
use fusion_oracle::types::{Decision, Direction};
use fusion_oracle::verdict::{Verdict, ENGINE_VERSION};
use fusion_oracle::{DecisionEngine, EngineConfig, EngineResult, RiskGuard};

/// Maximum number of recent verdicts retained for audit and settlement.
pub const MAX_RECENT_VERDICTS: usize = 100;

// =============================================================================
// Audit ring entry
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct VerdictEntry {
    pub verdict: Verdict,
    /// Conditions at decision time, used for regime reporting on settlement.
    pub conditions: MarketConditions,
    pub settled: bool,
}

/// Running counters since process start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub long: u64,
    pub short: u64,
    pub hold: u64,
    pub vetoed: u64,
    pub breaker_blocks: u64,
    pub settled: u64,
    pub correct: u64,
    pub cumulative_pnl_percent: f64,
}

impl CycleStats {
    fn record_verdict(&mut self, v: &Verdict) {
        self.total_cycles += 1;
        match v.direction {
            Decision::Long => self.long += 1,
            Decision::Short => self.short += 1,
            Decision::Hold => self.hold += 1,
        }
        if v.veto_applied {
            self.vetoed += 1;
        }
        if v.circuit_breaker {
            self.breaker_blocks += 1;
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.settled == 0 {
            0.0
        } else {
            self.correct as f64 / self.settled as f64
        }
    }
}

/// Result of settling a stored verdict.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub receipt: SettlementReceipt,
    pub reflection: ReflectionInsight,
    pub recommended_weights: BTreeMap<String, f64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SettleError {
    UnknownVerdict,
    AlreadySettled,
}

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    pub engine: DecisionEngine,
    pub risk: RiskGuard,
    pub reflection: RwLock<ReflectionEngine>,
    pub recent_verdicts: RwLock<VecDeque<VerdictEntry>>,
    pub stats: RwLock<CycleStats>,
    /// Monotonically increasing version, bumped on every state change.
    pub state_version: AtomicU64,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: EngineConfig, trust: Option<ReflectionSnapshot>) -> EngineResult<Self> {
        let risk = RiskGuard::new(&config.breaker);
        let sources: Vec<String> = config.fusion.roster.keys().cloned().collect();
        let reflection = match trust {
            Some(snapshot) => {
                ReflectionEngine::restore(config.reflection.clone(), sources, snapshot)
            }
            None => ReflectionEngine::new(config.reflection.clone(), sources),
        };
        let engine = DecisionEngine::new(config)?;

        Ok(Self {
            engine,
            risk,
            reflection: RwLock::new(reflection),
            recent_verdicts: RwLock::new(VecDeque::with_capacity(MAX_RECENT_VERDICTS)),
            stats: RwLock::new(CycleStats::default()),
            state_version: AtomicU64::new(1),
            started_at: Instant::now(),
        })
    }

    /// Bump the state version so WebSocket clients receive an update.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Append a verdict to the audit ring. Capacity is bounded to
    /// [`MAX_RECENT_VERDICTS`]; oldest entries are evicted first.
    pub fn push_verdict(&self, verdict: Verdict, conditions: MarketConditions) {
        self.stats.write().record_verdict(&verdict);
        {
            let mut ring = self.recent_verdicts.write();
            ring.push_back(VerdictEntry {
                verdict,
                conditions,
                settled: false,
            });
            while ring.len() > MAX_RECENT_VERDICTS {
                ring.pop_front();
            }
        }
        self.increment_version();
    }

    /// Settle a stored verdict: update the risk state, then reflect.
    pub fn settle(
        &self,
        verdict_id: &str,
        actual: Direction,
        pnl_percent: f64,
    ) -> Result<SettlementOutcome, SettleError> {
        let (verdict, conditions) = {
            let mut ring = self.recent_verdicts.write();
            let entry = ring
                .iter_mut()
                .find(|e| e.verdict.id == verdict_id)
                .ok_or(SettleError::UnknownVerdict)?;
            if entry.settled {
                return Err(SettleError::AlreadySettled);
            }
            entry.settled = true;
            (entry.verdict.clone(), entry.conditions.clone())
        };

        let receipt = self.risk.settle(&verdict, actual, pnl_percent);

        let record = SettledRecord::from_verdict(
            &verdict,
            actual,
            receipt.pnl_percent,
            Some(conditions),
        );
        let (reflection, recommended_weights) = {
            let mut engine = self.reflection.write();
            let insight = engine.reflect_one(&record);
            (insight, engine.recommended_weights())
        };

        {
            let mut stats = self.stats.write();
            stats.settled += 1;
            if receipt.was_correct {
                stats.correct += 1;
            }
            stats.cumulative_pnl_percent += receipt.pnl_percent;
        }
        self.increment_version();

        Ok(SettlementOutcome {
            receipt,
            reflection,
            recommended_weights,
        })
    }

    /// Force a new risk period dated today (UTC).
    pub fn reset_period(&self) {
        self.risk.reset_period(Utc::now().date_naive());
        self.increment_version();
    }

    /// Roll the risk period when the UTC date changed.
    pub fn roll_period_if_needed(&self) -> bool {
        let rolled = self.risk.roll_period(Utc::now().date_naive());
        if rolled {
            self.increment_version();
        }
        rolled
    }

    pub fn risk_snapshot(&self) -> RiskSnapshot {
        let state = self.risk.snapshot();
        RiskSnapshot {
            risk_mode: state.risk_mode(),
            breaker_triggered: state.is_breaker_triggered(),
            circuit_breakers: state.circuit_breakers(),
            state,
        }
    }

    pub fn trust_snapshot(&self) -> TrustSnapshot {
        let engine = self.reflection.read();
        TrustSnapshot {
            trust_by_source: engine.trust_scores(),
            recommended_weights: engine.recommended_weights(),
            records: engine.export_state().trust,
            regime_patterns: engine.regime_patterns().clone(),
            threshold_suggestion: engine.threshold_suggestion(),
            total_trades_analyzed: engine.total_trades_analyzed(),
        }
    }

    /// Build the full state snapshot for the dashboard and WebSocket feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let version = self.current_state_version();
        let last_verdict = self
            .recent_verdicts
            .read()
            .back()
            .map(|e| e.verdict.clone());

        StateSnapshot {
            state_version: version,
            server_time: Utc::now().timestamp_millis(),
            engine_version: ENGINE_VERSION,
            uptime_secs: self.started_at.elapsed().as_secs(),
            risk: self.risk_snapshot(),
            trust: self.trust_snapshot(),
            stats: self.stats.read().clone(),
            last_verdict,
        }
    }

    pub fn export_trust(&self) -> ReflectionSnapshot {
        let snapshot = self.reflection.read().export_state();
        info!(sources = snapshot.trust.len(), "trust state exported");
        snapshot
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub state: RiskState,
    pub risk_mode: RiskMode,
    pub breaker_triggered: bool,
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrustSnapshot {
    pub trust_by_source: BTreeMap<String, f64>,
    pub recommended_weights: BTreeMap<String, f64>,
    pub records: BTreeMap<String, TrustRecord>,
    pub regime_patterns: BTreeMap<String, RegimePattern>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_suggestion: Option<ThresholdSuggestion>,
    pub total_trades_analyzed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub engine_version: &'static str,
    pub uptime_secs: u64,
    pub risk: RiskSnapshot,
    pub trust: TrustSnapshot,
    pub stats: CycleStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<Verdict>,
}
