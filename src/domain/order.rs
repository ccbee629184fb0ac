use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Day,
    Gtd,
}

/// Canonical venue-agnostic order status. Each adapter maps its own status
/// set onto this one; unknown venue statuses map to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Accepted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub tif: TimeInForce,
    pub client_id: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub decision_id: Option<String>,
}

impl Order {
    pub fn market(symbol: Symbol, side: OrderSide, size: Decimal, client_id: String) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            tif: TimeInForce::Gtc,
            client_id,
            stop_loss: None,
            take_profit: None,
            decision_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub avg_price: Decimal,
    #[serde(skip)]
    pub raw: Option<serde_json::Value>,
}
