//! Bounded LRU cache of loaded weights

use std::collections::HashMap;
use std::sync::Arc;

use super::ModelWeights;
use super::store::WeightKey;

struct CacheEntry {
    weights: Arc<ModelWeights>,
    hash: String,
    last_access: u64,
}

/// LRU cache keyed by `(variant, version)`.
///
/// `len() <= capacity()` always holds; inserting into a full cache evicts the
/// least recently used entry.
pub struct WeightCache {
    capacity: usize,
    entries: HashMap<WeightKey, CacheEntry>,
    clock: u64,
}

impl WeightCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &WeightKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up and mark as most recently used
    pub fn get(&mut self, key: &WeightKey) -> Option<(Arc<ModelWeights>, String)> {
        self.clock += 1;
        let now = self.clock;
        self.entries.get_mut(key).map(|entry| {
            entry.last_access = now;
            (Arc::clone(&entry.weights), entry.hash.clone())
        })
    }

    /// Insert, evicting the least recently used entry if full. Returns the evicted key.
    pub fn insert(&mut self, key: WeightKey, weights: Arc<ModelWeights>, hash: String) -> Option<WeightKey> {
        self.clock += 1;
        let mut evicted = None;

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone());

            if let Some(old) = oldest {
                self.entries.remove(&old);
                log::debug!("Evicted weights {old} from cache");
                evicted = Some(old);
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                weights,
                hash,
                last_access: self.clock,
            },
        );
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Cached keys, most recently used first
    pub fn keys(&self) -> Vec<WeightKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|(k, e)| (k.clone(), e.last_access)).collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1));
        keys.into_iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ModelVariant};

    fn weights() -> Arc<ModelWeights> {
        let config = ModelConfig {
            num_freq_bins: 3,
            hidden_dim: 2,
            num_heads: 1,
            num_layers: 1,
            ffn_multiplier: 1,
            ffn_kernel_size: 1,
            norm_groups: 1,
            max_seq_len: 4,
            ..ModelConfig::base()
        };
        Arc::new(ModelWeights::zeros(ModelVariant::TwoStem, "v1", &config))
    }

    fn key(version: &str) -> WeightKey {
        WeightKey::new(ModelVariant::TwoStem, version)
    }

    #[test]
    fn test_evicts_oldest_on_overflow() {
        let mut cache = WeightCache::new(3);
        for v in ["v1", "v2", "v3"] {
            assert!(cache.insert(key(v), weights(), v.into()).is_none());
        }
        let evicted = cache.insert(key("v4"), weights(), "v4".into());

        assert_eq!(evicted, Some(key("v1")));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key("v1")));
        assert!(cache.contains(&key("v4")));
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache = WeightCache::new(2);
        cache.insert(key("a"), weights(), "a".into());
        cache.insert(key("b"), weights(), "b".into());

        assert!(cache.get(&key("a")).is_some());
        cache.insert(key("c"), weights(), "c".into());

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert_eq!(cache.keys(), vec![key("c"), key("a")]);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let mut cache = WeightCache::new(2);
        cache.insert(key("a"), weights(), "a".into());
        cache.insert(key("b"), weights(), "b".into());
        assert!(cache.insert(key("a"), weights(), "a2".into()).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")).map(|(_, h)| h), Some("a2".to_string()));
    }

    #[test]
    fn test_clear() {
        let mut cache = WeightCache::new(3);
        cache.insert(key("a"), weights(), "a".into());
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&key("a")).is_none());
    }
}
