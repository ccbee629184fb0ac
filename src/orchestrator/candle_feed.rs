//! REST-polling bridge from [`BrokerAdapter::get_ticker`] into a
//! [`CandleEvent`] stream.
//!
//! None of the adapters in [`crate::broker`] wire a parsed WebSocket candle
//! feed into a channel — `subscribe_candles` only registers the
//! subscription for reconnect bookkeeping (spec §4.5). This bridges the
//! gap the same way [`crate::broker::alpaca::AlpacaAdapter`] bridges its own
//! missing user-stream: a bounded-cadence poll task, spawned once and
//! stopped by dropping the receiver, standing in for a real per-venue
//! candle parser until one is wired up.

use crate::broker::{BrokerAdapter, CandleEvent};
use crate::domain::candle::Candle;
use crate::domain::symbol::Symbol;
use crate::domain::timeframe::Timeframe;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;
const MIN_POLL_MS: u64 = 1_000;

/// Spawns the poll task and returns the receiver end of its channel. The
/// task exits once the receiver is dropped.
pub fn spawn(
    adapter: Arc<dyn BrokerAdapter>,
    symbol: Symbol,
    timeframe: Timeframe,
    symbol_idx: u32,
) -> mpsc::Receiver<CandleEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let period_ms = (timeframe.interval_ms() as u64).max(MIN_POLL_MS);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        let mut open_of_period: Option<Decimal> = None;
        let mut high = Decimal::ZERO;
        let mut low = Decimal::ZERO;
        let mut period_start = 0i64;
        loop {
            interval.tick().await;
            let ticker = match adapter.get_ticker(&symbol).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("candle feed poll failed for {symbol}: {e}");
                    continue;
                }
            };
            let this_period = timeframe.period_start(ticker.ts_ms);
            if open_of_period.is_none() || this_period != period_start {
                period_start = this_period;
                open_of_period = Some(ticker.price);
                high = ticker.price;
                low = ticker.price;
            } else {
                high = high.max(ticker.price);
                low = low.min(ticker.price);
            }
            let candle = Candle {
                timestamp_ms: period_start,
                open: open_of_period.unwrap(),
                high,
                low,
                close: ticker.price,
                volume: Decimal::ZERO,
            };
            if candle.validate().is_err() {
                warn!("dropping malformed synthetic candle for {symbol}");
                continue;
            }
            let event = CandleEvent { symbol_idx, timeframe, candle, etime_ms: ticker.ts_ms };
            if tx.send(event).await.is_err() {
                debug!("candle feed receiver dropped for {symbol}; stopping poll bridge");
                return;
            }
        }
    });
    rx
}
