//! Bounded cache for indicator results, keyed on a digest of the closes the
//! indicator was computed over plus its parameters. FIFO eviction once the
//! cache ceiling is hit — simpler than a true LRU and sufficient, since the
//! spec only requires a size bound, not recency-aware eviction.

use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

const DEFAULT_CAPACITY: usize = 1000;
const DIGEST_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub indicator: &'static str,
    pub digest: u64,
    pub params: u64,
}

impl CacheKey {
    pub fn new(indicator: &'static str, closes: &[Decimal], params: u64) -> Self {
        let tail = &closes[closes.len().saturating_sub(DIGEST_WINDOW)..];
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for c in tail {
            c.hash(&mut hasher);
        }
        closes.len().hash(&mut hasher);
        CacheKey {
            indicator,
            digest: hasher.finish(),
            params,
        }
    }
}

pub struct IndicatorCache<V: Clone> {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, V>,
}

impl<V: Clone> Default for IndicatorCache<V> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<V: Clone> IndicatorCache<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: CacheKey, value: V) {
        if !self.entries.contains_key(&key) {
            if self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.order.push_back(key);
        }
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn evicts_oldest_entry_once_capacity_is_exceeded() {
        let mut cache: IndicatorCache<f64> = IndicatorCache::with_capacity(2);
        let k1 = CacheKey::new("rsi", &[dec!(1)], 14);
        let k2 = CacheKey::new("rsi", &[dec!(2)], 14);
        let k3 = CacheKey::new("rsi", &[dec!(3)], 14);
        cache.insert(k1, 1.0);
        cache.insert(k2, 2.0);
        cache.insert(k3, 3.0);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn same_closes_and_params_hit_cache() {
        let closes = vec![dec!(1), dec!(2), dec!(3)];
        let k1 = CacheKey::new("ema", &closes, 20);
        let k2 = CacheKey::new("ema", &closes, 20);
        assert_eq!(k1, k2);
    }
}
