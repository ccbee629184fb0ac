use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::Symbol;

/// One level of a staged profit-taking plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub index: usize,
    pub target_pct: Decimal,
    pub target_price: Decimal,
    pub exit_fraction: Decimal,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletedTier {
    pub index: usize,
    pub exit_price: Decimal,
    pub exit_size: Decimal,
    pub realized_pnl: Decimal,
    pub timestamp_ms: i64,
}

/// Validates the tier-set invariants of the spec: strictly increasing
/// `target_pct`, and `sum(exit_fraction) <= 1.0`.
pub fn validate_tiers(tiers: &[Tier]) -> Result<(), String> {
    for w in tiers.windows(2) {
        if w[1].target_pct <= w[0].target_pct {
            return Err("tier target_pct must be strictly increasing".to_string());
        }
    }
    let total: Decimal = tiers.iter().map(|t| t.exit_fraction).sum();
    if total > Decimal::ONE {
        return Err(format!("tier exit_fraction sums to {total}, must be <= 1.0"));
    }
    Ok(())
}

/// Internal spot-style position. `size_base == 0` iff the position is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub size_base: Decimal,
    pub entry_price: Decimal,
    pub entry_time_ms: i64,
    pub high_water: Decimal,
    pub low_water: Decimal,
    pub current_stop: Decimal,
    pub initial_stop: Decimal,
    pub trailing_active: bool,
    pub breakeven_active: bool,
    pub tiers: Vec<Tier>,
    pub completed_tiers: Vec<CompletedTier>,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.size_base.is_zero()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.size_base.is_sign_negative() {
            return Err("size_base must be >= 0".to_string());
        }
        validate_tiers(&self.tiers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tier(i: usize, pct: Decimal, frac: Decimal) -> Tier {
        Tier {
            index: i,
            target_pct: pct,
            target_price: Decimal::ZERO,
            exit_fraction: frac,
            completed: false,
        }
    }

    #[test]
    fn rejects_non_increasing_targets() {
        let tiers = vec![tier(0, dec!(0.01), dec!(0.3)), tier(1, dec!(0.01), dec!(0.3))];
        assert!(validate_tiers(&tiers).is_err());
    }

    #[test]
    fn rejects_fractions_over_one() {
        let tiers = vec![
            tier(0, dec!(0.005), dec!(0.6)),
            tier(1, dec!(0.01), dec!(0.6)),
        ];
        assert!(validate_tiers(&tiers).is_err());
    }

    #[test]
    fn accepts_well_formed_tier_ladder() {
        let tiers = vec![
            tier(0, dec!(0.005), dec!(0.3)),
            tier(1, dec!(0.01), dec!(0.3)),
            tier(2, dec!(0.015), dec!(0.2)),
            tier(3, dec!(0.025), dec!(0.2)),
        ];
        assert!(validate_tiers(&tiers).is_ok());
    }
}
