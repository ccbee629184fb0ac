use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub order_id: String,
    pub action: OrderSide,
    pub size: Decimal,
    pub price: Decimal,
    pub entry_price: Decimal,
    pub entry_time_ms: i64,
}

/// Single source of truth for balance, position and active trades in the
/// spot-style, single-symbol baseline (§9 open question: multi-symbol books
/// are out of scope for v1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: Decimal,
    pub total_balance: Decimal,
    pub in_position: Decimal,
    pub position: Decimal,
    pub entry_price: Decimal,
    pub active_trades: IndexMap<String, Trade>,
    pub realized_pnl: Decimal,
    pub is_trading: bool,
    pub recovery_mode: bool,
    pub last_update_ms: i64,
    pub daily_trade_count: u32,
    pub paused_at: Option<i64>,
    pub pause_reason: Option<String>,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            balance: Decimal::ZERO,
            total_balance: Decimal::ZERO,
            in_position: Decimal::ZERO,
            position: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            active_trades: IndexMap::new(),
            realized_pnl: Decimal::ZERO,
            is_trading: true,
            recovery_mode: false,
            last_update_ms: 0,
            daily_trade_count: 0,
            paused_at: None,
            pause_reason: None,
        }
    }
}

const EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 1e-8

impl AccountState {
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        if self.position.is_zero() {
            Decimal::ZERO
        } else {
            self.position * (current_price - self.entry_price)
        }
    }

    pub fn total_pnl(&self, current_price: Decimal) -> Decimal {
        self.realized_pnl + self.unrealized_pnl(current_price)
    }

    /// Checks the invariants of spec §3/§8: non-negative balance and
    /// position, and the balance/in_position/total_balance reconciliation.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.balance.is_sign_negative() {
            issues.push("balance is negative".to_string());
        }
        if self.position.is_sign_negative() {
            issues.push("position is negative".to_string());
        }
        let reconciled = self.balance + self.in_position;
        if (reconciled - self.total_balance).abs() > EPSILON {
            issues.push(format!(
                "balance + in_position ({reconciled}) does not match total_balance ({})",
                self.total_balance
            ));
        }
        let steady_state_in_position = self.in_position > Decimal::ZERO;
        let steady_state_entry = self.entry_price > Decimal::ZERO;
        let steady_state_position = self.position > Decimal::ZERO;
        if steady_state_in_position != steady_state_entry || steady_state_entry != steady_state_position
        {
            issues.push(
                "in_position > 0, entry_price > 0 and position > 0 must all agree".to_string(),
            );
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_state_has_no_invariant_issues() {
        assert!(AccountState::default().validate().is_empty());
    }

    #[test]
    fn flags_negative_balance() {
        let mut s = AccountState::default();
        s.balance = dec!(-1);
        assert!(!s.validate().is_empty());
    }

    #[test]
    fn flags_balance_reconciliation_drift() {
        let mut s = AccountState::default();
        s.balance = dec!(100);
        s.in_position = dec!(50);
        s.total_balance = dec!(1000);
        assert!(!s.validate().is_empty());
    }

    #[test]
    fn unrealized_and_total_pnl_are_derived() {
        let mut s = AccountState::default();
        s.position = dec!(2);
        s.entry_price = dec!(100);
        s.realized_pnl = dec!(10);
        assert_eq!(s.unrealized_pnl(dec!(110)), dec!(20));
        assert_eq!(s.total_pnl(dec!(110)), dec!(30));
    }
}
