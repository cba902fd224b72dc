// =============================================================================
// Market Conditions — coarse regime labels for reflection diagnostics
// =============================================================================
//
// Three readings are derived from a close series:
//   - RSI with Wilder's smoothing, seeded by the SMA of the first `period`
//     gains/losses.
//   - Trend from a fast/slow EMA pair (each seeded with an SMA).
//   - Volatility band from the per-step sample sigma of log-returns.
//
// The labels feed regime pattern reporting only. Nothing here influences
// sizing or the veto.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::ConditionsParams;
use crate::monte_carlo::estimate_volatility;
use crate::technical::ema_series;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Neutral,
}

impl Trend {
    fn label(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityBand {
    Low,
    #[default]
    Normal,
    High,
}

impl VolatilityBand {
    fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Market snapshot attached to a settled verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    #[serde(default = "neutral_rsi")]
    pub rsi: f64,
    #[serde(default)]
    pub trend: Trend,
    #[serde(default)]
    pub volatility: VolatilityBand,
}

fn neutral_rsi() -> f64 {
    50.0
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            rsi: neutral_rsi(),
            trend: Trend::Neutral,
            volatility: VolatilityBand::Normal,
        }
    }
}

impl MarketConditions {
    /// Derive conditions from closes. Readings that need more history than
    /// is available keep their neutral defaults.
    pub fn from_prices(closes: &[f64], params: &ConditionsParams) -> Self {
        let rsi = wilder_rsi(closes, params.rsi_period).unwrap_or_else(neutral_rsi);

        let trend = match (
            last_ema(closes, params.fast_ema),
            last_ema(closes, params.slow_ema),
        ) {
            (Some(fast), Some(slow)) if fast > slow => Trend::Up,
            (Some(fast), Some(slow)) if fast < slow => Trend::Down,
            _ => Trend::Neutral,
        };

        let volatility = if closes.len() < 3 {
            VolatilityBand::Normal
        } else {
            let sigma = estimate_volatility(closes);
            if sigma < params.low_vol {
                VolatilityBand::Low
            } else if sigma > params.high_vol {
                VolatilityBand::High
            } else {
                VolatilityBand::Normal
            }
        };

        Self {
            rsi,
            trend,
            volatility,
        }
    }

    pub fn rsi_band(&self) -> &'static str {
        if self.rsi > 70.0 {
            "overbought"
        } else if self.rsi < 30.0 {
            "oversold"
        } else {
            "neutral"
        }
    }

    /// `"{trend}_{rsi_band}_{vol_band}"`, e.g. `up_overbought_high`.
    pub fn regime_label(&self) -> String {
        format!(
            "{}_{}_{}",
            self.trend.label(),
            self.rsi_band(),
            self.volatility.label()
        )
    }
}

// =============================================================================
// Indicators
// =============================================================================

/// Most recent Wilder RSI, or `None` with fewer than `period + 1` closes.
pub fn wilder_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;

    let (gain, loss) = deltas[..period].iter().fold((0.0, 0.0), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l - d)
        }
    });
    let mut avg_gain = gain / p;
    let mut avg_loss = loss / p;

    for &d in &deltas[period..] {
        avg_gain = (avg_gain * (p - 1.0) + d.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-d).max(0.0)) / p;
    }

    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };

    rsi.is_finite().then_some(rsi)
}

/// Last value of an SMA-seeded EMA, or `None` with fewer than `period` closes.
pub fn last_ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| from + step * i as f64).collect()
    }

    #[test]
    fn default_conditions_label() {
        assert_eq!(MarketConditions::default().regime_label(), "neutral_neutral_normal");
    }

    #[test]
    fn rsi_band_edges_are_strict() {
        let mut c = MarketConditions::default();
        c.rsi = 70.0;
        assert_eq!(c.rsi_band(), "neutral");
        c.rsi = 70.1;
        assert_eq!(c.rsi_band(), "overbought");
        c.rsi = 30.0;
        assert_eq!(c.rsi_band(), "neutral");
        c.rsi = 29.9;
        assert_eq!(c.rsi_band(), "oversold");
    }

    #[test]
    fn rsi_extremes() {
        assert_eq!(wilder_rsi(&ramp(1.0, 1.0, 30), 14), Some(100.0));
        assert_eq!(wilder_rsi(&ramp(30.0, -1.0, 30), 14), Some(0.0));
        assert_eq!(wilder_rsi(&[100.0; 30], 14), Some(50.0));
        assert_eq!(wilder_rsi(&ramp(1.0, 1.0, 14), 14), None);
    }

    #[test]
    fn ema_of_constant_series_is_constant() {
        let ema = last_ema(&[42.0; 30], 9).unwrap();
        assert!((ema - 42.0).abs() < 1e-10);
        assert!(last_ema(&[1.0, 2.0], 9).is_none());
    }

    #[test]
    fn rising_market_is_up_and_overbought() {
        let closes = ramp(100.0, 1.0, 40);
        let c = MarketConditions::from_prices(&closes, &ConditionsParams::default());
        assert_eq!(c.trend, Trend::Up);
        assert_eq!(c.rsi_band(), "overbought");
        assert!(c.regime_label().starts_with("up_overbought_"));
    }

    #[test]
    fn falling_market_is_down_and_oversold() {
        let closes = ramp(200.0, -1.0, 40);
        let c = MarketConditions::from_prices(&closes, &ConditionsParams::default());
        assert_eq!(c.trend, Trend::Down);
        assert_eq!(c.rsi_band(), "oversold");
    }

    #[test]
    fn volatility_bands() {
        let params = ConditionsParams::default();
        let calm = MarketConditions::from_prices(&[100.0; 30], &params);
        assert_eq!(calm.volatility, VolatilityBand::Low);

        let wild: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 105.0 })
            .collect();
        let c = MarketConditions::from_prices(&wild, &params);
        assert_eq!(c.volatility, VolatilityBand::High);

        let short = MarketConditions::from_prices(&[100.0, 101.0], &params);
        assert_eq!(short, MarketConditions::default());
    }
}
