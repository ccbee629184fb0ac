use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV candle. Invariants are enforced by [`Candle::validate`], not by the
/// constructor, so adapters can build a candle from wire data and then
/// explicitly validate before it enters the store (per spec: malformed
/// messages are dropped, not panicked on).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn validate(&self) -> Result<(), String> {
        if !self.open.is_sign_positive()
            || !self.high.is_sign_positive()
            || !self.low.is_sign_positive()
            || !self.close.is_sign_positive()
            || self.volume.is_sign_negative()
        {
            return Err("candle has negative price or volume".to_string());
        }
        if self.low > self.open.min(self.close) {
            return Err("low must be <= min(open, close)".to_string());
        }
        if self.high < self.open.max(self.close) {
            return Err("high must be >= max(open, close)".to_string());
        }
        if self.high < self.low {
            return Err("high must be >= low".to_string());
        }
        Ok(())
    }

    /// Aggregate a non-empty, timestamp-ascending slice of base candles into
    /// a single higher-timeframe candle (open of first, close of last, max
    /// high, min low, sum volume).
    pub fn aggregate(candles: &[Candle]) -> Option<Candle> {
        let first = candles.first()?;
        let last = candles.last()?;
        let high = candles.iter().map(|c| c.high).max()?;
        let low = candles.iter().map(|c| c.low).min()?;
        let volume: Decimal = candles.iter().map(|c| c.volume).sum();
        Some(Candle {
            timestamp_ms: first.timestamp_ms,
            open: first.open,
            high,
            low,
            close: last.close,
            volume,
        })
    }
}
