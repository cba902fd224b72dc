// =============================================================================
// Technical Analysis Consensus — close-only indicator vote
// =============================================================================
//
// Each indicator that has enough history may cast a biased vote:
//
//   RSI         > 70 votes SHORT, < 30 votes LONG (strength scales with depth)
//   MACD        histogram sign change in the last bar (12/26/9)
//   Bollinger   touch of the outer 5 % of the 20-bar, 2σ band; a squeeze
//               (bandwidth < 4 %) is reported as a NEUTRAL vote
//   Divergence  RSI vs price over the last 10 bars
//
// The consensus is the side with more votes, NEUTRAL on a tie, and its
// confidence is |long - short| / max(1, long + short). The result is advisory
// and only feeds the recommendation attached to refined verdicts.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::conditions::wilder_rsi;
use crate::types::Direction;

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const BB_PERIOD: usize = 20;
const BB_STD: f64 = 2.0;
/// Bandwidth (percent of the middle band) below which the bands are squeezed.
const BB_SQUEEZE_WIDTH: f64 = 4.0;
const DIVERGENCE_LOOKBACK: usize = 10;

// =============================================================================
// Indicator results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Crossover {
    Bullish,
    Bearish,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub crossover: Crossover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle * 100.
    pub bandwidth: f64,
    /// 0 at the lower band, 1 at the upper band.
    pub position: f64,
    pub squeeze: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    /// LONG for a bullish divergence, SHORT for a bearish one.
    pub bias: Direction,
    pub rsi_current: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Indicator {
    Rsi,
    Macd,
    Bollinger,
    Divergence,
}

/// One indicator's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaSignal {
    pub indicator: Indicator,
    pub signal: String,
    pub bias: Direction,
    pub strength: f64,
}

/// Indicator readings plus the vote they produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalAnalysis {
    pub data_points: usize,
    pub rsi: Option<f64>,
    pub macd: Option<Macd>,
    pub bollinger: Option<Bollinger>,
    pub divergence: Option<Divergence>,
    pub signals: Vec<TaSignal>,
    pub consensus: Direction,
    pub confidence: f64,
}

impl TechnicalAnalysis {
    /// Run every indicator over `closes` (oldest first).
    pub fn from_closes(closes: &[f64]) -> Self {
        let mut signals = Vec::new();

        let rsi = wilder_rsi(closes, RSI_PERIOD);
        if let Some(r) = rsi {
            if r > 70.0 {
                signals.push(vote(Indicator::Rsi, "OVERBOUGHT", Direction::Short, (r - 70.0) / 30.0));
            } else if r < 30.0 {
                signals.push(vote(Indicator::Rsi, "OVERSOLD", Direction::Long, (30.0 - r) / 30.0));
            }
        }

        let macd = macd(closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        match macd.as_ref().map(|m| m.crossover) {
            Some(Crossover::Bullish) => {
                signals.push(vote(Indicator::Macd, "BULLISH_CROSSOVER", Direction::Long, 0.7))
            }
            Some(Crossover::Bearish) => {
                signals.push(vote(Indicator::Macd, "BEARISH_CROSSOVER", Direction::Short, 0.7))
            }
            _ => {}
        }

        let bollinger = bollinger(closes, BB_PERIOD, BB_STD);
        if let Some(bb) = &bollinger {
            if bb.squeeze {
                signals.push(vote(Indicator::Bollinger, "SQUEEZE_DETECTED", Direction::Neutral, 0.8));
            }
            if bb.position > 0.95 {
                signals.push(vote(Indicator::Bollinger, "UPPER_BAND_TOUCH", Direction::Short, 0.5));
            } else if bb.position < 0.05 {
                signals.push(vote(Indicator::Bollinger, "LOWER_BAND_TOUCH", Direction::Long, 0.5));
            }
        }

        let divergence = divergence(closes, RSI_PERIOD, DIVERGENCE_LOOKBACK);
        if let Some(d) = &divergence {
            let name = if d.bias == Direction::Long {
                "BULLISH_DIVERGENCE"
            } else {
                "BEARISH_DIVERGENCE"
            };
            signals.push(vote(Indicator::Divergence, name, d.bias, 0.85));
        }

        let long = signals.iter().filter(|s| s.bias == Direction::Long).count();
        let short = signals.iter().filter(|s| s.bias == Direction::Short).count();
        let consensus = match long.cmp(&short) {
            std::cmp::Ordering::Greater => Direction::Long,
            std::cmp::Ordering::Less => Direction::Short,
            std::cmp::Ordering::Equal => Direction::Neutral,
        };
        let confidence = long.abs_diff(short) as f64 / (long + short).max(1) as f64;

        Self {
            data_points: closes.len(),
            rsi,
            macd,
            bollinger,
            divergence,
            signals,
            consensus,
            confidence,
        }
    }
}

fn vote(indicator: Indicator, signal: &str, bias: Direction, strength: f64) -> TaSignal {
    TaSignal {
        indicator,
        signal: signal.to_string(),
        bias,
        strength: strength.min(1.0),
    }
}

// =============================================================================
// Indicators
// =============================================================================

/// SMA-seeded EMA series. Element `i` corresponds to close `period - 1 + i`.
///
/// Empty when `period` is zero or the input is shorter than `period`. The
/// series stops at the first non-finite value.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(closes.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &c in &closes[period..] {
        let ema = c * k + prev * (1.0 - k);
        if !ema.is_finite() {
            break;
        }
        out.push(ema);
        prev = ema;
    }
    out
}

/// MACD line, signal line and the crossover of the last two histogram bars.
/// Needs at least `slow + signal` closes.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow || closes.len() < slow + signal {
        return None;
    }

    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);
    let line: Vec<f64> = ema_fast
        .get(slow - fast..)?
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| f - s)
        .collect();

    let signal_line = ema_series(&line, signal);
    let offset = line.len().checked_sub(signal_line.len())?;
    let histogram: Vec<f64> = line[offset..]
        .iter()
        .zip(&signal_line)
        .map(|(m, s)| m - s)
        .collect();

    let crossover = match histogram.as_slice() {
        [.., prev, last] if *prev < 0.0 && *last >= 0.0 => Crossover::Bullish,
        [.., prev, last] if *prev > 0.0 && *last <= 0.0 => Crossover::Bearish,
        _ => Crossover::None,
    };

    Some(Macd {
        macd: *line.last()?,
        signal: *signal_line.last()?,
        histogram: *histogram.last()?,
        crossover,
    })
}

/// Bollinger bands over the last `period` closes (population σ).
pub fn bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<Bollinger> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std = variance.sqrt();

    let upper = middle + num_std * std;
    let lower = middle - num_std * std;
    let bandwidth = (upper - lower) / middle * 100.0;
    let current = closes[closes.len() - 1];
    let position = if upper > lower {
        (current - lower) / (upper - lower)
    } else {
        0.5
    };

    Some(Bollinger {
        upper,
        middle,
        lower,
        bandwidth,
        position,
        squeeze: bandwidth < BB_SQUEEZE_WIDTH,
    })
}

/// RSI/price divergence between the two halves of the last `lookback` bars.
///
/// Bullish: price makes a lower low while RSI makes a higher low.
/// Bearish: price makes a higher high while RSI makes a lower high.
pub fn divergence(closes: &[f64], period: usize, lookback: usize) -> Option<Divergence> {
    if lookback < 2 || closes.len() < period + lookback {
        return None;
    }

    let start = closes.len() - lookback;
    let rsi: Vec<f64> = (0..lookback)
        .map(|i| wilder_rsi(&closes[..start + i + 1], period))
        .collect::<Option<_>>()?;
    let price = &closes[start..];
    let mid = lookback / 2;

    let min = |s: &[f64]| s.iter().copied().fold(f64::INFINITY, f64::min);
    let max = |s: &[f64]| s.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let bias = if min(&price[mid..]) < min(&price[..mid]) && min(&rsi[mid..]) > min(&rsi[..mid]) {
        Direction::Long
    } else if max(&price[mid..]) > max(&price[..mid]) && max(&rsi[mid..]) < max(&rsi[..mid]) {
        Direction::Short
    } else {
        return None;
    };

    Some(Divergence {
        bias,
        rsi_current: rsi[lookback - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(from: f64, step: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| from + step * i as f64).collect()
    }

    #[test]
    fn ema_series_is_sma_seeded() {
        let s = ema_series(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(s.len(), 2);
        assert!((s[0] - 2.0).abs() < 1e-12);
        assert!((s[1] - 3.0).abs() < 1e-12);
        assert!(ema_series(&[1.0], 3).is_empty());
        assert!(ema_series(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn macd_needs_enough_history() {
        assert!(macd(&ramp(100.0, 1.0, 34), 12, 26, 9).is_none());
        let m = macd(&ramp(100.0, 1.0, 35), 12, 26, 9).unwrap();
        // A steady ramp keeps the fast EMA above the slow one.
        assert!(m.macd > 0.0);
    }

    #[test]
    fn macd_flags_bullish_crossover_on_reversal() {
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - 0.02 * (i * i) as f64).collect();
        let bottom = closes[59];
        closes.extend((1..=6).map(|i| bottom + 5.0 * i as f64));

        let crossovers: Vec<(usize, Crossover)> = (50..=closes.len())
            .filter_map(|n| macd(&closes[..n], 12, 26, 9).map(|m| (n, m.crossover)))
            .filter(|(_, c)| *c != Crossover::None)
            .collect();
        assert_eq!(crossovers, vec![(62, Crossover::Bullish)]);
    }

    #[test]
    fn flat_series_is_a_squeeze_at_mid_band() {
        let bb = bollinger(&[100.0; 20], 20, 2.0).unwrap();
        assert!(bb.squeeze);
        assert_eq!(bb.bandwidth, 0.0);
        assert_eq!(bb.position, 0.5);
        assert!(bollinger(&[100.0; 19], 20, 2.0).is_none());
    }

    #[test]
    fn band_position_tracks_last_close() {
        let mut closes: Vec<f64> = (0..19).map(|i| if i % 2 == 0 { 99.0 } else { 101.0 }).collect();
        closes.push(110.0);
        let bb = bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.position > 0.95);
        assert!(bb.upper > bb.middle && bb.middle > bb.lower);
    }

    #[test]
    fn rising_market_votes_short_on_overbought() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + 0.05 * (i * i) as f64).collect();
        let ta = TechnicalAnalysis::from_closes(&closes);
        assert_eq!(ta.rsi, Some(100.0));
        assert!(ta
            .signals
            .iter()
            .any(|s| s.indicator == Indicator::Rsi && s.bias == Direction::Short));
        assert!(ta
            .signals
            .iter()
            .any(|s| s.signal == "UPPER_BAND_TOUCH"));
        assert_eq!(ta.macd.as_ref().map(|m| m.crossover), Some(Crossover::None));
        assert_eq!(ta.consensus, Direction::Short);
        assert_eq!(ta.confidence, 1.0);
    }

    #[test]
    fn short_history_is_neutral() {
        let ta = TechnicalAnalysis::from_closes(&[100.0, 101.0, 100.5]);
        assert!(ta.rsi.is_none());
        assert!(ta.macd.is_none());
        assert!(ta.bollinger.is_none());
        assert!(ta.signals.is_empty());
        assert_eq!(ta.consensus, Direction::Neutral);
        assert_eq!(ta.confidence, 0.0);
    }

    #[test]
    fn squeeze_vote_does_not_tilt_consensus() {
        let ta = TechnicalAnalysis::from_closes(&[100.0; 40]);
        assert!(ta
            .signals
            .iter()
            .any(|s| s.signal == "SQUEEZE_DETECTED" && s.bias == Direction::Neutral));
        assert_eq!(ta.consensus, Direction::Neutral);
    }
}
