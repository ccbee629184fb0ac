use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported candle timeframes, carrying their interval in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Timeframe {
    S1,
    S5,
    S15,
    S30,
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Timeframe {
    /// Interval length in milliseconds. `Mo1` uses a 30-day approximation,
    /// matching the venues that only ever emit monthly candles on a fixed grid.
    pub fn interval_ms(&self) -> i64 {
        use Timeframe::*;
        match self {
            S1 => 1_000,
            S5 => 5_000,
            S15 => 15_000,
            S30 => 30_000,
            M1 => 60_000,
            M3 => 3 * 60_000,
            M5 => 5 * 60_000,
            M15 => 15 * 60_000,
            M30 => 30 * 60_000,
            H1 => 3_600_000,
            H2 => 2 * 3_600_000,
            H4 => 4 * 3_600_000,
            H6 => 6 * 3_600_000,
            H8 => 8 * 3_600_000,
            H12 => 12 * 3_600_000,
            D1 => 86_400_000,
            D3 => 3 * 86_400_000,
            W1 => 7 * 86_400_000,
            Mo1 => 30 * 86_400_000,
        }
    }

    pub fn all() -> &'static [Timeframe] {
        use Timeframe::*;
        &[
            S1, S5, S15, S30, M1, M3, M5, M15, M30, H1, H2, H4, H6, H8, H12, D1, D3, W1, Mo1,
        ]
    }

    /// The start-of-period timestamp (ms) containing `timestamp_ms`, aligned to
    /// the UNIX epoch. Used to bucket base candles into a higher timeframe.
    pub fn period_start(&self, timestamp_ms: i64) -> i64 {
        let period = self.interval_ms();
        timestamp_ms - timestamp_ms.rem_euclid(period)
    }

    pub fn is_period_start(&self, timestamp_ms: i64) -> bool {
        timestamp_ms.rem_euclid(self.interval_ms()) == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Timeframe::*;
        let s = match self {
            S1 => "1s",
            S5 => "5s",
            S15 => "15s",
            S30 => "30s",
            M1 => "1m",
            M3 => "3m",
            M5 => "5m",
            M15 => "15m",
            M30 => "30m",
            H1 => "1h",
            H2 => "2h",
            H4 => "4h",
            H6 => "6h",
            H8 => "8h",
            H12 => "12h",
            D1 => "1d",
            D3 => "3d",
            W1 => "1w",
            Mo1 => "1M",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        use Timeframe::*;
        Ok(match s {
            "1s" => S1,
            "5s" => S5,
            "15s" => S15,
            "30s" => S30,
            "1m" => M1,
            "3m" => M3,
            "5m" => M5,
            "15m" => M15,
            "30m" => M30,
            "1h" => H1,
            "2h" => H2,
            "4h" => H4,
            "6h" => H6,
            "8h" => H8,
            "12h" => H12,
            "1d" => D1,
            "3d" => D3,
            "1w" => W1,
            "1M" => Mo1,
            _ => return Err(anyhow!("invalid timeframe: '{s}'")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ms_monotonic_with_declaration_order() {
        let all = Timeframe::all();
        for w in all.windows(2) {
            assert!(w[0].interval_ms() < w[1].interval_ms());
        }
    }

    #[test]
    fn roundtrips_through_display_and_from_str() {
        for tf in Timeframe::all() {
            let s = tf.to_string();
            assert_eq!(Timeframe::from_str(&s).unwrap(), *tf);
        }
    }

    #[test]
    fn period_start_aligns_to_grid() {
        let tf = Timeframe::M5;
        let base = 1_704_067_200_000i64; // aligned 5m boundary
        assert_eq!(tf.period_start(base), base);
        assert_eq!(tf.period_start(base + 3 * 60_000), base);
        assert_eq!(tf.period_start(base + 5 * 60_000), base + 5 * 60_000);
    }
}
