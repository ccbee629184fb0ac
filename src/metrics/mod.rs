//! Prometheus metrics, `tradecore_`-prefixed, continuing the teacher's
//! `infrastructure::observability::metrics` naming convention. Push-based
//! registry only; no HTTP exposition server is wired up (out of scope),
//! matching SPEC_FULL §1's ambient-observability note.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub balance_usd: GenericGauge<AtomicF64>,
    pub position_size: GenericGaugeVec<AtomicF64>,
    pub unrealized_pnl_usd: GenericGauge<AtomicF64>,
    pub realized_pnl_usd: GenericGauge<AtomicF64>,
    pub is_trading: GenericGauge<AtomicF64>,
    pub reconciliations_total: CounterVec,
    pub drift_magnitude: GaugeVec,
    pub signal_confidence: HistogramVec,
    pub orders_total: CounterVec,
    pub websocket_reconnects_total: CounterVec,
    pub rate_limit_backoff_seconds: GenericGauge<AtomicF64>,
    pub api_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let balance_usd = Gauge::with_opts(Opts::new("tradecore_balance_usd", "Free balance in quote currency"))?;
        registry.register(Box::new(balance_usd.clone()))?;

        let position_size = GaugeVec::new(
            Opts::new("tradecore_position_size", "Open position size in base units, per symbol"),
            &["symbol"],
        )?;
        registry.register(Box::new(position_size.clone()))?;

        let unrealized_pnl_usd =
            Gauge::with_opts(Opts::new("tradecore_unrealized_pnl_usd", "Unrealized PnL of the open position"))?;
        registry.register(Box::new(unrealized_pnl_usd.clone()))?;

        let realized_pnl_usd =
            Gauge::with_opts(Opts::new("tradecore_realized_pnl_usd", "Cumulative realized PnL"))?;
        registry.register(Box::new(realized_pnl_usd.clone()))?;

        let is_trading = Gauge::with_opts(Opts::new("tradecore_is_trading", "1 when trading is active, 0 when paused"))?;
        registry.register(Box::new(is_trading.clone()))?;

        let reconciliations_total = CounterVec::new(
            Opts::new("tradecore_reconciliations_total", "Reconciliation runs by severity outcome"),
            &["severity"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let drift_magnitude = GaugeVec::new(
            Opts::new("tradecore_drift_magnitude", "Most recent drift magnitude by dimension"),
            &["dimension"],
        )?;
        registry.register(Box::new(drift_magnitude.clone()))?;

        let signal_confidence = HistogramVec::new(
            HistogramOpts::new("tradecore_signal_confidence", "SignalEngine confidence scores at evaluation time")
                .buckets(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]),
            &["symbol", "direction"],
        )?;
        registry.register(Box::new(signal_confidence.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("tradecore_orders_total", "Orders submitted by side and status"),
            &["broker", "side", "status"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let websocket_reconnects_total = CounterVec::new(
            Opts::new("tradecore_websocket_reconnects_total", "Adapter WebSocket reconnection attempts"),
            &["broker"],
        )?;
        registry.register(Box::new(websocket_reconnects_total.clone()))?;

        let rate_limit_backoff_seconds = Gauge::with_opts(Opts::new(
            "tradecore_rate_limit_backoff_seconds",
            "Current REST rate-limit backoff duration",
        ))?;
        registry.register(Box::new(rate_limit_backoff_seconds.clone()))?;

        let api_latency_seconds = HistogramVec::new(
            HistogramOpts::new("tradecore_api_latency_seconds", "Adapter REST call latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["broker", "endpoint"],
        )?;
        registry.register(Box::new(api_latency_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            balance_usd,
            position_size,
            unrealized_pnl_usd,
            realized_pnl_usd,
            is_trading,
            reconciliations_total,
            drift_magnitude,
            signal_confidence,
            orders_total,
            websocket_reconnects_total,
            rate_limit_backoff_seconds,
            api_latency_seconds,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }

    pub fn set_position(&self, symbol: &str, size: f64) {
        self.position_size.with_label_values(&[symbol]).set(size);
    }

    pub fn inc_reconciliation(&self, severity: &str) {
        self.reconciliations_total.with_label_values(&[severity]).inc();
    }

    pub fn set_drift(&self, dimension: &str, magnitude: f64) {
        self.drift_magnitude.with_label_values(&[dimension]).set(magnitude);
    }

    pub fn observe_confidence(&self, symbol: &str, direction: &str, confidence: f64) {
        self.signal_confidence.with_label_values(&[symbol, direction]).observe(confidence);
    }

    pub fn inc_orders(&self, broker: &str, side: &str, status: &str) {
        self.orders_total.with_label_values(&[broker, side, status]).inc();
    }

    pub fn inc_reconnects(&self, broker: &str) {
        self.websocket_reconnects_total.with_label_values(&[broker]).inc();
    }

    pub fn observe_api_latency(&self, broker: &str, endpoint: &str, latency: f64) {
        self.api_latency_seconds.with_label_values(&[broker, endpoint]).observe(latency);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct default metrics registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new().unwrap();
        metrics.balance_usd.set(1000.0);
        metrics.inc_reconciliation("small");
        let rendered = metrics.render();
        assert!(rendered.contains("tradecore_balance_usd"));
        assert!(rendered.contains("tradecore_reconciliations_total"));
    }

    #[test]
    fn per_symbol_position_gauge_is_labeled() {
        let metrics = Metrics::new().unwrap();
        metrics.set_position("BTC/USD", 0.5);
        let rendered = metrics.render();
        assert!(rendered.contains("symbol=\"BTC/USD\""));
    }
}
