//! `BrokerAdapter`: the uniform contract every venue implementation
//! exposes. The orchestrator programs against this trait alone, the way
//! the teacher's `domain::ports::{MarketDataService, ExecutionService}`
//! traits decouple strategy/risk code from concrete venues — generalized
//! here from two narrow traits into the full lifecycle/identity/account/
//! orders/market-data/streaming/symbol-map surface of spec §4.5.

pub mod alpaca;
pub mod binance;
pub mod instant_conversion;
pub mod oanda;
pub mod rate_limiter;

use crate::domain::asset::{AssetType, Fees};
use crate::domain::candle::Candle;
use crate::domain::errors::AdapterError;
use crate::domain::order::{Order, OrderResult};
use crate::domain::symbol::Symbol;
use crate::domain::timeframe::Timeframe;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Canonical candle-stream event shape (spec §4.5 "candle normalization").
#[derive(Debug, Clone, Copy)]
pub struct CandleEvent {
    pub symbol_idx: u32,
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub etime_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub price: Decimal,
    pub ts_ms: i64,
}

/// A single price level of an order book snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts_ms: i64,
}

pub type Balance = HashMap<String, Decimal>;

/// The contract all venue implementations expose. Methods that a given
/// venue cannot support return `AdapterError::NotSupported` rather than
/// panicking (spec §9 Design Notes, "Polymorphism").
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    // --- Lifecycle ---
    async fn connect(&self) -> Result<bool, AdapterError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;

    // --- Identity ---
    fn broker_name(&self) -> &str;
    fn asset_type(&self) -> AssetType;
    fn supported_symbols(&self) -> Vec<Symbol>;
    fn min_order_size(&self, symbol: &Symbol) -> Decimal;
    fn fees(&self) -> Fees;
    fn is_tradeable_now(&self, symbol: &Symbol) -> bool;

    // --- Account ---
    async fn get_balance(&self) -> Result<Balance, AdapterError>;
    async fn get_positions(&self) -> Result<Vec<(Symbol, Decimal)>, AdapterError>;
    async fn get_open_orders(&self) -> Result<Vec<Order>, AdapterError>;

    // --- Orders ---
    async fn place_order(&self, order: Order) -> Result<OrderResult, AdapterError>;
    async fn cancel_order(&self, order_id: &str) -> Result<bool, AdapterError>;
    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult, AdapterError>;
    async fn modify_order(&self, _order_id: &str, _new_price: Option<Decimal>) -> Result<OrderResult, AdapterError> {
        Err(AdapterError::NotSupported("modify_order".to_string()))
    }

    // --- Market data ---
    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, AdapterError>;
    async fn get_candles(&self, symbol: &Symbol, tf: Timeframe, limit: usize) -> Result<Vec<Candle>, AdapterError>;
    async fn get_order_book(&self, symbol: &Symbol, depth: usize) -> Result<OrderBook, AdapterError>;

    // --- Streaming ---
    async fn subscribe_ticker(&self, symbol: &Symbol) -> Result<(), AdapterError>;
    async fn subscribe_candles(&self, symbol: &Symbol, tf: Timeframe) -> Result<(), AdapterError>;
    async fn subscribe_order_book(&self, symbol: &Symbol) -> Result<(), AdapterError>;
    async fn subscribe_account(&self) -> Result<(), AdapterError>;
    async fn unsubscribe_all(&self);

    // --- Symbol map ---
    fn to_venue_symbol(&self, symbol: &Symbol) -> String;
    fn from_venue_symbol(&self, venue_symbol: &str) -> Option<Symbol>;
}

/// Maps a venue-specific order status string onto the canonical set.
/// Unknown venue statuses map to `Pending` (spec §4.5).
pub fn map_order_status(venue_status: &str, mapping: &[(&str, crate::domain::order::OrderStatus)]) -> crate::domain::order::OrderStatus {
    use crate::domain::order::OrderStatus;
    mapping
        .iter()
        .find(|(venue, _)| venue.eq_ignore_ascii_case(venue_status))
        .map(|(_, canonical)| *canonical)
        .unwrap_or(OrderStatus::Pending)
}
