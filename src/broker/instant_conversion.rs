//! Test double exercising the "instant-conversion, no order book" adapter
//! rule of spec §4.5: such venues accept only MARKET orders and must
//! reject LIMIT requests at the adapter rather than silently convert them.
//! None of the three primary venues ([`super::binance`], [`super::alpaca`],
//! [`super::oanda`]) is instant-conversion-only, so this small adapter
//! exists purely to give that branch of the contract a conformance test
//! (SPEC_FULL §4.5).

use super::{Balance, BrokerAdapter, OrderBook, Ticker};
use crate::domain::asset::{AssetType, Fees};
use crate::domain::candle::Candle;
use crate::domain::errors::AdapterError;
use crate::domain::order::{Order, OrderResult, OrderStatus, OrderType};
use crate::domain::symbol::{Symbol, SymbolMap};
use crate::domain::timeframe::Timeframe;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};

struct IdentitySymbolMap;

impl SymbolMap for IdentitySymbolMap {
    fn to_venue(&self, symbol: &Symbol) -> Option<String> {
        Some(symbol.as_str().replace('/', "-"))
    }

    fn from_venue(&self, venue_symbol: &str) -> Option<Symbol> {
        let (base, quote) = venue_symbol.split_once('-')?;
        Some(Symbol::new(base, quote))
    }
}

/// Spot-only, no order book: only MARKET orders are accepted. Positions
/// are reported synthetically as positive base-currency balances, and
/// historical candles are unavailable (both per spec §4.5).
pub struct InstantConversionAdapter {
    connected: AtomicBool,
    symbol_map: IdentitySymbolMap,
}

impl Default for InstantConversionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InstantConversionAdapter {
    pub fn new() -> Self {
        Self { connected: AtomicBool::new(false), symbol_map: IdentitySymbolMap }
    }
}

#[async_trait]
impl BrokerAdapter for InstantConversionAdapter {
    async fn connect(&self) -> Result<bool, AdapterError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn broker_name(&self) -> &str {
        "instant-conversion-test-double"
    }

    fn asset_type(&self) -> AssetType {
        AssetType::Crypto
    }

    fn supported_symbols(&self) -> Vec<Symbol> {
        vec![Symbol::new("BTC", "USD")]
    }

    fn min_order_size(&self, _symbol: &Symbol) -> Decimal {
        dec!(0.0001)
    }

    fn fees(&self) -> Fees {
        Fees { maker: dec!(0.005), taker: dec!(0.005) } // instant-conversion venues charge a spread premium
    }

    fn is_tradeable_now(&self, _symbol: &Symbol) -> bool {
        true
    }

    async fn get_balance(&self) -> Result<Balance, AdapterError> {
        Ok(Balance::new())
    }

    async fn get_positions(&self) -> Result<Vec<(Symbol, Decimal)>, AdapterError> {
        Ok(Vec::new())
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>, AdapterError> {
        Ok(Vec::new())
    }

    async fn place_order(&self, order: Order) -> Result<OrderResult, AdapterError> {
        if order.order_type != OrderType::Market {
            return Err(AdapterError::OrderRejected(
                "instant-conversion venues accept MARKET orders only".to_string(),
            ));
        }
        Ok(OrderResult {
            order_id: order.client_id,
            status: OrderStatus::Filled,
            filled: order.size,
            remaining: Decimal::ZERO,
            avg_price: order.price.unwrap_or(Decimal::ZERO),
            raw: None,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<bool, AdapterError> {
        Err(AdapterError::NotSupported("instant-conversion fills are immediate; nothing to cancel".to_string()))
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResult, AdapterError> {
        Ok(OrderResult {
            order_id: order_id.to_string(),
            status: OrderStatus::Filled,
            filled: Decimal::ZERO,
            remaining: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            raw: None,
        })
    }

    async fn get_ticker(&self, _symbol: &Symbol) -> Result<Ticker, AdapterError> {
        Ok(Ticker { price: Decimal::ZERO, ts_ms: 0 })
    }

    async fn get_candles(&self, _symbol: &Symbol, _tf: Timeframe, _limit: usize) -> Result<Vec<Candle>, AdapterError> {
        // No historical candles on this venue: empty series, never synthesized.
        Ok(Vec::new())
    }

    async fn get_order_book(&self, _symbol: &Symbol, _depth: usize) -> Result<OrderBook, AdapterError> {
        Err(AdapterError::NotSupported("instant-conversion venues have no order book".to_string()))
    }

    async fn subscribe_ticker(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn subscribe_candles(&self, _symbol: &Symbol, _tf: Timeframe) -> Result<(), AdapterError> {
        Err(AdapterError::NotSupported("no historical/streaming candles on this venue".to_string()))
    }

    async fn subscribe_order_book(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
        Err(AdapterError::NotSupported("instant-conversion venues have no order book".to_string()))
    }

    async fn subscribe_account(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn unsubscribe_all(&self) {}

    fn to_venue_symbol(&self, symbol: &Symbol) -> String {
        self.symbol_map.to_venue(symbol).unwrap_or_else(|| symbol.as_str().to_string())
    }

    fn from_venue_symbol(&self, venue_symbol: &str) -> Option<Symbol> {
        self.symbol_map.from_venue(venue_symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{OrderSide, TimeInForce};

    fn limit_order() -> Order {
        Order {
            symbol: Symbol::new("BTC", "USD"),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            size: dec!(1),
            price: Some(dec!(50000)),
            tif: TimeInForce::Gtc,
            client_id: "c1".to_string(),
            stop_loss: None,
            take_profit: None,
            decision_id: None,
        }
    }

    #[tokio::test]
    async fn limit_orders_are_rejected_not_silently_converted() {
        let adapter = InstantConversionAdapter::new();
        let err = adapter.place_order(limit_order()).await.unwrap_err();
        assert!(matches!(err, AdapterError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn market_orders_fill_immediately() {
        let adapter = InstantConversionAdapter::new();
        let mut order = limit_order();
        order.order_type = OrderType::Market;
        let result = adapter.place_order(order).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn historical_candles_are_empty_not_synthesized() {
        let adapter = InstantConversionAdapter::new();
        let candles = adapter.get_candles(&Symbol::new("BTC", "USD"), Timeframe::M1, 100).await.unwrap();
        assert!(candles.is_empty());
    }

    #[test]
    fn symbol_roundtrip_holds() {
        let map = IdentitySymbolMap;
        let s = Symbol::new("BTC", "USD");
        assert_eq!(map.from_venue(&map.to_venue(&s).unwrap()).unwrap(), s);
    }
}
