use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
pub enum DriftSeverity {
    None,
    Small,
    Large,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Drift {
    pub position_drift_base: Decimal,
    pub balance_drift_quote: Decimal,
    pub has_unknown_position: bool,
    pub severity: DriftSeverity,
    pub ts_ms: i64,
}

pub struct DriftThresholds {
    pub warning: Decimal,
    pub pause: Decimal,
}

impl Drift {
    /// Classify severity per spec §3: `critical` when the venue reports a
    /// base position the StateManager doesn't know about; `large`/`small`
    /// when either drift dimension crosses the pause/warning threshold.
    pub fn classify(
        position_drift_base: Decimal,
        balance_drift_quote: Decimal,
        has_unknown_position: bool,
        thresholds: &DriftThresholds,
        ts_ms: i64,
    ) -> Drift {
        let abs_pos = position_drift_base.abs();
        let abs_bal = balance_drift_quote.abs();
        let severity = if has_unknown_position {
            DriftSeverity::Critical
        } else if abs_pos > thresholds.pause || abs_bal > thresholds.pause {
            DriftSeverity::Large
        } else if abs_pos > thresholds.warning || abs_bal > thresholds.warning {
            DriftSeverity::Small
        } else {
            DriftSeverity::None
        };
        Drift {
            position_drift_base,
            balance_drift_quote,
            has_unknown_position,
            severity,
            ts_ms,
        }
    }
}
