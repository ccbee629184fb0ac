//! Periodic diff of `StateManager` against adapter truth, drift
//! classification and the auto-correct/pause/hard-stop policy of spec
//! §4.6. Grounded on the teacher's `RiskManager`/`PortfolioValuationService`
//! pairing (periodic valuation against a `Portfolio` source of truth) and
//! `OrderReconciler`'s TTL-bounded reconciliation loop, generalized from
//! order-fill reconciliation to full balance/position drift against a
//! venue.

use crate::broker::BrokerAdapter;
use crate::config::Mode;
use crate::domain::drift::{Drift, DriftSeverity, DriftThresholds};
use crate::domain::errors::ReconciliationError;
use crate::domain::symbol::Symbol;
use crate::state::StateManager;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DRIFT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled,
    Busy,
    SkippedPaperMode,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileResult {
    pub outcome: ReconcileOutcome,
    pub drift: Option<Drift>,
}

/// Aggregate statistics over the bounded drift history (spec §4.6
/// "Exposed statistics").
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftStats {
    pub avg_position_drift: Decimal,
    pub max_position_drift: Decimal,
    pub avg_balance_drift: Decimal,
    pub max_balance_drift: Decimal,
    pub critical_count: u64,
}

pub struct Reconciler {
    state: Arc<StateManager>,
    adapter: Arc<dyn BrokerAdapter>,
    symbol: Symbol,
    mode: Mode,
    thresholds: DriftThresholds,
    is_reconciling: AtomicBool,
    history: Mutex<VecDeque<Drift>>,
}

impl Reconciler {
    pub fn new(
        state: Arc<StateManager>,
        adapter: Arc<dyn BrokerAdapter>,
        symbol: Symbol,
        mode: Mode,
        thresholds: DriftThresholds,
    ) -> Self {
        Self {
            state,
            adapter,
            symbol,
            mode,
            thresholds,
            is_reconciling: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(DRIFT_HISTORY_CAPACITY)),
        }
    }

    /// Runs one reconciliation synchronously before returning (spec §4.6
    /// "to prevent trading on unreliable state"); propagates failure as an
    /// error so the caller refuses to start the orchestrator loop.
    pub async fn start(&self, block_until_first: bool, now_ms: i64) -> Result<(), ReconciliationError> {
        if block_until_first {
            let result = self.reconcile_now(now_ms).await?;
            info!("initial reconciliation complete: {:?}", result.outcome);
        }
        Ok(())
    }

    /// Fetches adapter balance + positions + open orders as one sequence;
    /// if any fetch fails the whole sequence is discarded and trading is
    /// paused (fail-closed, spec §5/§7). At most one reconciliation runs at
    /// a time; an overlapping call returns `Busy` immediately.
    pub async fn reconcile_now(&self, now_ms: i64) -> Result<ReconcileResult, ReconciliationError> {
        if matches!(self.mode, Mode::Paper) {
            return Ok(ReconcileResult { outcome: ReconcileOutcome::SkippedPaperMode, drift: None });
        }

        if self
            .is_reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(ReconcileResult { outcome: ReconcileOutcome::Busy, drift: None });
        }

        let result = self.do_reconcile(now_ms).await;
        self.is_reconciling.store(false, Ordering::SeqCst);
        result
    }

    async fn do_reconcile(&self, now_ms: i64) -> Result<ReconcileResult, ReconciliationError> {
        let balance = self
            .adapter
            .get_balance()
            .await
            .map_err(|e| ReconciliationError::FetchFailed(e.to_string()));
        let positions = self
            .adapter
            .get_positions()
            .await
            .map_err(|e| ReconciliationError::FetchFailed(e.to_string()));
        let open_orders = self
            .adapter
            .get_open_orders()
            .await
            .map_err(|e| ReconciliationError::FetchFailed(e.to_string()));

        let (balance, positions, _open_orders) = match (balance, positions, open_orders) {
            (Ok(b), Ok(p), Ok(o)) => (b, p, o),
            _ => {
                let reason = "reconciliation fetch sequence failed; pausing trading fail-closed".to_string();
                error!("{reason}");
                if let Err(e) = self.state.pause_trading(reason.clone(), now_ms) {
                    warn!("failed to pause trading after reconciliation fetch failure: {e}");
                }
                return Err(ReconciliationError::FetchFailed(reason));
            }
        };

        let snapshot = self.state.snapshot();
        let venue_position = positions
            .iter()
            .find(|(sym, _)| *sym == self.symbol)
            .map(|(_, size)| *size)
            .unwrap_or(Decimal::ZERO);
        let venue_balance = balance.get(self.symbol.quote()).copied().unwrap_or(Decimal::ZERO);

        let position_drift = venue_position - snapshot.position;
        let balance_drift = venue_balance - snapshot.balance;
        let has_unknown_position = snapshot.position.is_zero() && !venue_position.is_zero();

        let drift = Drift::classify(position_drift, balance_drift, has_unknown_position, &self.thresholds, now_ms);
        self.record(drift).await;
        self.apply_action(drift, venue_balance, venue_position, now_ms);

        Ok(ReconcileResult { outcome: ReconcileOutcome::Reconciled, drift: Some(drift) })
    }

    fn apply_action(&self, drift: Drift, venue_balance: Decimal, venue_position: Decimal, now_ms: i64) {
        match drift.severity {
            DriftSeverity::None => {}
            DriftSeverity::Small => {
                if let Err(e) = self.state.apply_reconciliation(venue_balance, venue_position, now_ms) {
                    warn!("small-drift auto-correction rejected: {e}");
                }
            }
            DriftSeverity::Large => {
                let reason = format!(
                    "large drift detected: position_drift={}, balance_drift={}",
                    drift.position_drift_base, drift.balance_drift_quote
                );
                warn!("{reason}");
                if let Err(e) = self.state.pause_trading(reason, now_ms) {
                    warn!("failed to pause trading on large drift: {e}");
                }
            }
            DriftSeverity::Critical => {
                let reason = format!(
                    "critical drift detected (unknown_position={}): position_drift={}, balance_drift={}",
                    drift.has_unknown_position, drift.position_drift_base, drift.balance_drift_quote
                );
                error!("{reason}");
                // Hard stop per spec §4.6: pause and engage recovery_mode only.
                // Positions/active trades are left intact — wiping them is
                // `emergency_reset`'s job, and that's a human-initiated
                // operation (§7), not something a reconciliation tick does
                // on its own.
                if let Err(e) = self.state.mark_recovery_mode(reason, now_ms) {
                    warn!("failed to engage recovery mode on critical drift: {e}");
                }
            }
        }
    }

    async fn record(&self, drift: Drift) {
        let mut history = self.history.lock().await;
        if history.len() >= DRIFT_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(drift);
    }

    /// Forces `StateManager` to the venue's truth and clears drift history.
    /// Human-initiated (spec §7 "Emergency operations ... explicitly
    /// override guards").
    pub async fn emergency_sync(&self, now_ms: i64) -> Result<(), ReconciliationError> {
        let balance = self
            .adapter
            .get_balance()
            .await
            .map_err(|e| ReconciliationError::FetchFailed(e.to_string()))?;
        let positions = self
            .adapter
            .get_positions()
            .await
            .map_err(|e| ReconciliationError::FetchFailed(e.to_string()))?;

        let venue_position = positions
            .iter()
            .find(|(sym, _)| *sym == self.symbol)
            .map(|(_, size)| *size)
            .unwrap_or(Decimal::ZERO);
        let venue_balance = balance.get(self.symbol.quote()).copied().unwrap_or(Decimal::ZERO);

        if let Err(e) = self.state.apply_reconciliation(venue_balance, venue_position, now_ms) {
            warn!("emergency sync rejected by invariant check: {e}");
        }
        self.history.lock().await.clear();
        info!("emergency sync complete; drift history cleared");
        Ok(())
    }

    pub async fn drift_history(&self) -> Vec<Drift> {
        self.history.lock().await.iter().copied().collect()
    }

    pub async fn stats(&self) -> DriftStats {
        let history = self.history.lock().await;
        if history.is_empty() {
            return DriftStats::default();
        }
        let n = Decimal::from(history.len() as i64);
        let sum_pos: Decimal = history.iter().map(|d| d.position_drift_base.abs()).sum();
        let sum_bal: Decimal = history.iter().map(|d| d.balance_drift_quote.abs()).sum();
        let max_pos = history.iter().map(|d| d.position_drift_base.abs()).max().unwrap_or(Decimal::ZERO);
        let max_bal = history.iter().map(|d| d.balance_drift_quote.abs()).max().unwrap_or(Decimal::ZERO);
        let critical_count = history.iter().filter(|d| d.severity == DriftSeverity::Critical).count() as u64;
        DriftStats {
            avg_position_drift: sum_pos / n,
            max_position_drift: max_pos,
            avg_balance_drift: sum_bal / n,
            max_balance_drift: max_bal,
            critical_count,
        }
    }

    pub fn default_interval() -> Duration {
        DEFAULT_INTERVAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Balance, OrderBook, Ticker};
    use crate::domain::asset::{AssetType, Fees};
    use crate::domain::candle::Candle;
    use crate::domain::errors::AdapterError;
    use crate::domain::order::{Order, OrderResult};
    use crate::domain::timeframe::Timeframe;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    struct FakeAdapter {
        balance: Decimal,
        position: Decimal,
        fail: bool,
    }

    #[async_trait]
    impl BrokerAdapter for FakeAdapter {
        async fn connect(&self) -> Result<bool, AdapterError> {
            Ok(true)
        }
        async fn disconnect(&self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn broker_name(&self) -> &str {
            "fake"
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
            if self.fail {
                return Err(AdapterError::TransientNetwork("down".to_string()));
            }
            let mut b = Balance::new();
            b.insert("USD".to_string(), self.balance);
            Ok(b)
        }
        async fn get_positions(&self) -> Result<Vec<(Symbol, Decimal)>, AdapterError> {
            if self.fail {
                return Err(AdapterError::TransientNetwork("down".to_string()));
            }
            if self.position.is_zero() {
                Ok(Vec::new())
            } else {
                Ok(vec![(Symbol::new("BTC", "USD"), self.position)])
            }
        }
        async fn get_open_orders(&self) -> Result<Vec<Order>, AdapterError> {
            Ok(Vec::new())
        }
        async fn place_order(&self, order: Order) -> Result<OrderResult, AdapterError> {
            Ok(OrderResult {
                order_id: order.client_id,
                status: crate::domain::order::OrderStatus::Filled,
                filled: order.size,
                remaining: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                raw: None,
            })
        }
        async fn cancel_order(&self, _order_id: &str) -> Result<bool, AdapterError> {
            Ok(true)
        }
        async fn get_order_status(&self, order_id: &str) -> Result<OrderResult, AdapterError> {
            Ok(OrderResult {
                order_id: order_id.to_string(),
                status: crate::domain::order::OrderStatus::Filled,
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
            Ok(OrderBook { bids: Vec::new(), asks: Vec::new(), ts_ms: 0 })
        }
        async fn subscribe_ticker(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn subscribe_candles(&self, _symbol: &Symbol, _tf: Timeframe) -> Result<(), AdapterError> {
            Ok(())
        }
        async fn subscribe_order_book(&self, _symbol: &Symbol) -> Result<(), AdapterError> {
            Ok(())
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

    fn thresholds() -> DriftThresholds {
        DriftThresholds { warning: dec!(0.001), pause: dec!(0.01) }
    }

    #[tokio::test]
    async fn critical_drift_halts_trading_matches_scenario_three() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        state.update_balance(dec!(10000), "seed".to_string(), 0).unwrap();
        assert!(state.is_trading());

        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(10000), position: dec!(0.01), fail: false });
        let reconciler = Reconciler::new(state.clone(), adapter, Symbol::new("BTC", "USD"), Mode::Live, thresholds());

        let result = reconciler.reconcile_now(1).await.unwrap();
        assert_eq!(result.drift.unwrap().severity, DriftSeverity::Critical);
        assert!(!state.is_trading());
    }

    #[tokio::test]
    async fn fetch_failure_pauses_trading_fail_closed() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        state.update_balance(dec!(10000), "seed".to_string(), 0).unwrap();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(0), position: dec!(0), fail: true });
        let reconciler = Reconciler::new(state.clone(), adapter, Symbol::new("BTC", "USD"), Mode::Live, thresholds());

        assert!(reconciler.reconcile_now(1).await.is_err());
        assert!(!state.is_trading());
    }

    #[tokio::test]
    async fn small_drift_auto_corrects_without_pausing() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        state.update_balance(dec!(10000), "seed".to_string(), 0).unwrap();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(10000.005), position: dec!(0), fail: false });
        let reconciler = Reconciler::new(state.clone(), adapter, Symbol::new("BTC", "USD"), Mode::Live, thresholds());

        let result = reconciler.reconcile_now(1).await.unwrap();
        assert_eq!(result.drift.unwrap().severity, DriftSeverity::Small);
        assert!(state.is_trading());
        assert_eq!(state.snapshot().balance, dec!(10000.005));
    }

    #[tokio::test]
    async fn paper_mode_skips_reconciliation() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(0), position: dec!(999), fail: false });
        let reconciler = Reconciler::new(state.clone(), adapter, Symbol::new("BTC", "USD"), Mode::Paper, thresholds());

        let result = reconciler.reconcile_now(1).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::SkippedPaperMode);
        assert!(state.is_trading());
    }

    #[tokio::test]
    async fn overlapping_reconciliation_returns_busy() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(0), position: dec!(0), fail: false });
        let reconciler = Arc::new(Reconciler::new(state, adapter, Symbol::new("BTC", "USD"), Mode::Live, thresholds()));
        reconciler.is_reconciling.store(true, Ordering::SeqCst);
        let result = reconciler.reconcile_now(1).await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Busy);
    }

    #[tokio::test]
    async fn drift_stats_report_critical_count() {
        let state = Arc::new(StateManager::new(Mode::Test, None));
        state.update_balance(dec!(10000), "seed".to_string(), 0).unwrap();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(FakeAdapter { balance: dec!(10000), position: dec!(0.01), fail: false });
        let reconciler = Reconciler::new(state, adapter, Symbol::new("BTC", "USD"), Mode::Live, thresholds());
        reconciler.reconcile_now(1).await.unwrap();
        let stats = reconciler.stats().await;
        assert_eq!(stats.critical_count, 1);
    }
}
