//! Black-box cross-module scenarios driven through the crate's public
//! surface only (no access to `Orchestrator`'s private step methods),
//! mirroring the teacher's top-level `tests/e2e_trading_flow.rs` shape:
//! wire real components together, drive them through one public entry
//! point, assert on `StateManager` afterward.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tradecore::broker::{Balance, BrokerAdapter, OrderBook, Ticker};
use tradecore::config::feature_flags::FeatureFlags;
use tradecore::config::{Mode, Tier};
use tradecore::domain::asset::{AssetType, Fees};
use tradecore::domain::candle::Candle;
use tradecore::domain::drift::DriftThresholds;
use tradecore::domain::errors::AdapterError;
use tradecore::domain::order::{Order, OrderResult, OrderStatus};
use tradecore::domain::symbol::Symbol;
use tradecore::domain::timeframe::Timeframe;
use tradecore::indicators::IndicatorEngine;
use tradecore::orchestrator::{Orchestrator, OrchestratorConfig};
use tradecore::profit::ProfitManagerConfig;
use tradecore::reconciler::Reconciler;
use tradecore::state::StateManager;

/// Reports a fixed balance/position pair as venue truth, independent of
/// anything the adapter was asked to trade.
struct StaticAdapter {
    balance_usd: Decimal,
    position_btc: Decimal,
}

#[async_trait]
impl BrokerAdapter for StaticAdapter {
    async fn connect(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }
    async fn disconnect(&self) {}
    fn is_connected(&self) -> bool {
        true
    }
    fn broker_name(&self) -> &str {
        "static-test-adapter"
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
        Fees { maker: Decimal::ZERO, taker: Decimal::ZERO }
    }
    fn is_tradeable_now(&self, _symbol: &Symbol) -> bool {
        true
    }
    async fn get_balance(&self) -> Result<Balance, AdapterError> {
        let mut b: HashMap<String, Decimal> = HashMap::new();
        b.insert("USD".to_string(), self.balance_usd);
        Ok(b)
    }
    async fn get_positions(&self) -> Result<Vec<(Symbol, Decimal)>, AdapterError> {
        if self.position_btc.is_zero() {
            Ok(Vec::new())
        } else {
            Ok(vec![(Symbol::new("BTC", "USD"), self.position_btc)])
        }
    }
    async fn get_open_orders(&self) -> Result<Vec<Order>, AdapterError> {
        Ok(Vec::new())
    }
    async fn place_order(&self, order: Order) -> Result<OrderResult, AdapterError> {
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
        Ok(true)
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
        Ok(Vec::new())
    }
    async fn get_order_book(&self, _symbol: &Symbol, _depth: usize) -> Result<OrderBook, AdapterError> {
        Err(AdapterError::NotSupported("no order book".to_string()))
    }
    async fn subscribe_ticker(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
        Ok(())
    }
    async fn subscribe_candles(&self, _symbol: &Symbol, _tf: Timeframe) -> Result<(), AdapterError> {
        Err(AdapterError::NotSupported("no streaming candles".to_string()))
    }
    async fn subscribe_order_book(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
        Err(AdapterError::NotSupported("no order book".to_string()))
    }
    async fn subscribe_account(&self) -> Result<(), AdapterError> {
        Ok(())
    }
    async fn unsubscribe_all(&self) {}
    fn to_venue_symbol(&self, symbol: &Symbol) -> String {
        symbol.as_str().to_string()
    }
    fn from_venue_symbol(&self, venue_symbol: &str) -> Option<Symbol> {
        Symbol::parse(venue_symbol).ok()
    }
}

fn symbol() -> Symbol {
    Symbol::new("BTC", "USD")
}

fn thresholds() -> DriftThresholds {
    DriftThresholds { warning: dec!(0.001), pause: dec!(0.01) }
}

fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        symbol: symbol(),
        mode: Mode::Test,
        base_timeframe: Timeframe::M1,
        higher_timeframes: vec![],
        indicator_window: 60,
        base_size: dec!(0.01),
        min_confidence: 20.0,
        tier: Tier::Starter,
        target_pcts: vec![dec!(0.005), dec!(0.01), dec!(0.02)],
        exit_fractions: vec![dec!(0.3), dec!(0.3), dec!(0.4)],
        profit: ProfitManagerConfig { min_hold_minutes: 0.0, ..ProfitManagerConfig::default() },
        reconcile_interval: Duration::from_secs(30),
    }
}

/// Spec §8 scenario 3: the venue reports a base position the
/// `StateManager` has no record of. `bootstrap`'s mandatory first
/// reconciliation must classify that as critical drift and pause trading
/// before the orchestrator's main loop ever starts.
#[tokio::test]
async fn critical_drift_at_bootstrap_pauses_trading_before_the_loop_starts() {
    let state = Arc::new(StateManager::new(Mode::Test, None));
    state.update_balance(dec!(100000), "seed".to_string(), 0).unwrap();
    assert!(state.is_trading());

    let adapter: Arc<dyn BrokerAdapter> =
        Arc::new(StaticAdapter { balance_usd: dec!(100000), position_btc: dec!(0.01) });
    let reconciler =
        Arc::new(Reconciler::new(state.clone(), adapter.clone(), symbol(), Mode::Test, thresholds()));
    let orchestrator = Orchestrator::new(
        orchestrator_config(),
        state.clone(),
        Arc::new(FeatureFlags::empty()),
        Arc::new(IndicatorEngine::new()),
        adapter,
        reconciler,
        None,
        None,
    );

    orchestrator.bootstrap(0).await.unwrap();

    assert!(!state.is_trading());
    assert!(state.snapshot().pause_reason.unwrap().contains("critical"));
}

/// Companion to the above: with matching balance and zero position on
/// both sides, bootstrap's reconciliation finds no drift and leaves
/// trading enabled.
#[tokio::test]
async fn matching_state_at_bootstrap_leaves_trading_enabled() {
    let state = Arc::new(StateManager::new(Mode::Test, None));
    state.update_balance(dec!(100000), "seed".to_string(), 0).unwrap();

    let adapter: Arc<dyn BrokerAdapter> =
        Arc::new(StaticAdapter { balance_usd: dec!(100000), position_btc: Decimal::ZERO });
    let reconciler =
        Arc::new(Reconciler::new(state.clone(), adapter.clone(), symbol(), Mode::Test, thresholds()));
    let orchestrator = Orchestrator::new(
        orchestrator_config(),
        state.clone(),
        Arc::new(FeatureFlags::empty()),
        Arc::new(IndicatorEngine::new()),
        adapter,
        reconciler,
        None,
        None,
    );

    orchestrator.bootstrap(0).await.unwrap();

    assert!(state.is_trading());
}
