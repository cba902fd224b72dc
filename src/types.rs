// =============================================================================
// Shared types used across the fusion engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Directional opinion carried by a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// The opposite actionable direction. Neutral stays neutral.
    pub fn flipped(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

impl FromStr for Direction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            "NEUTRAL" => Ok(Self::Neutral),
            other => Err(EngineError::InvalidSignal {
                reason: format!("unknown direction '{other}'"),
            }),
        }
    }
}

/// Final stance of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Long,
    Short,
    Hold,
}

impl Decision {
    pub fn is_actionable(self) -> bool {
        !matches!(self, Self::Hold)
    }

    /// Whether this stance agrees with a realized market direction.
    /// HOLD never agrees with anything.
    pub fn matches(self, outcome: Direction) -> bool {
        matches!(
            (self, outcome),
            (Self::Long, Direction::Long) | (Self::Short, Direction::Short)
        )
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::Hold
    }
}

impl From<Direction> for Decision {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => Self::Long,
            Direction::Short => Self::Short,
            Direction::Neutral => Self::Hold,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

// =============================================================================
// Signal
// =============================================================================

/// One source's opinion for one decision cycle.
///
/// `confidence` and `weight` are clamped into `[0, 1]` at construction;
/// non-finite inputs collapse to `0.0`. Fields are private so a constructed
/// signal cannot be mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    source_id: String,
    direction: Direction,
    confidence: f64,
    weight: f64,
    reasoning: String,
}

impl Signal {
    pub fn new(
        source_id: impl Into<String>,
        direction: Direction,
        confidence: f64,
        weight: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            direction,
            confidence: clamp_unit(confidence),
            weight: clamp_unit(weight),
            reasoning: reasoning.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
