//! Compression result caching.
//!
//! Results are keyed by `(item_id, target_ratio, strategy)`. Each entry also
//! remembers a hash of the content it was computed from, so an item whose
//! content changed under the same id misses instead of returning a stale
//! result. Changing the compression configuration invalidates everything.

use super::{CompressionResult, CompressionStrategy};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    item_id: String,
    ratio_bits: u64,
    strategy: CompressionStrategy,
}

impl CacheKey {
    fn new(item_id: &str, ratio: f64, strategy: CompressionStrategy) -> Self {
        Self {
            item_id: item_id.to_string(),
            ratio_bits: ratio.to_bits(),
            strategy,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content_hash: u64,
    result: CompressionResult,
    /// Insertion sequence, for oldest-first eviction.
    sequence: u64,
}

/// Diagnostics for [`CompressionCache`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Bounded cache of compression results.
#[derive(Debug)]
pub struct CompressionCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    next_sequence: u64,
    hits: u64,
    misses: u64,
}

impl CompressionCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            next_sequence: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a result computed from exactly `content`.
    pub fn get(
        &mut self,
        item_id: &str,
        ratio: f64,
        strategy: CompressionStrategy,
        content: &str,
    ) -> Option<CompressionResult> {
        let key = CacheKey::new(item_id, ratio, strategy);
        match self.entries.get(&key) {
            Some(entry) if entry.content_hash == hash_content(content) => {
                self.hits += 1;
                Some(entry.result.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(
        &mut self,
        item_id: &str,
        ratio: f64,
        strategy: CompressionStrategy,
        content: &str,
        result: CompressionResult,
    ) {
        if self.max_entries == 0 {
            return;
        }
        let key = CacheKey::new(item_id, ratio, strategy);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            key,
            CacheEntry {
                content_hash: hash_content(content),
                result,
                sequence,
            },
        );
    }

    /// Drop every entry (strategy or configuration changed).
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Drop entries for one item, whatever ratio or strategy.
    pub fn invalidate_item(&mut self, item_id: &str) {
        self.entries.retain(|k, _| k.item_id != item_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                self.hits as f64 / total as f64
            },
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|(_, v)| v.sequence)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest_key);
        }
    }
}

impl Default for CompressionCache {
    fn default() -> Self {
        Self::new(256)
    }
}

/// FNV-1a over the content bytes.
fn hash_content(content: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(text: &str) -> CompressionResult {
        CompressionResult::unchanged(text, CompressionStrategy::Summarization.label())
    }

    #[test]
    fn hit_requires_matching_content() {
        let mut cache = CompressionCache::new(10);
        cache.put("a", 0.5, CompressionStrategy::Summarization, "one", result("one"));

        assert!(cache.get("a", 0.5, CompressionStrategy::Summarization, "one").is_some());
        assert!(cache.get("a", 0.5, CompressionStrategy::Summarization, "two").is_none());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn ratio_and_strategy_are_part_of_key() {
        let mut cache = CompressionCache::new(10);
        cache.put("a", 0.5, CompressionStrategy::Summarization, "x", result("x"));
        assert!(cache.get("a", 0.6, CompressionStrategy::Summarization, "x").is_none());
        assert!(cache.get("a", 0.5, CompressionStrategy::KeywordExtraction, "x").is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut cache = CompressionCache::new(2);
        cache.put("a", 0.5, CompressionStrategy::Summarization, "a", result("a"));
        cache.put("b", 0.5, CompressionStrategy::Summarization, "b", result("b"));
        cache.put("c", 0.5, CompressionStrategy::Summarization, "c", result("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", 0.5, CompressionStrategy::Summarization, "a").is_none());
        assert!(cache.get("c", 0.5, CompressionStrategy::Summarization, "c").is_some());
    }

    #[test]
    fn invalidation() {
        let mut cache = CompressionCache::new(10);
        cache.put("a", 0.5, CompressionStrategy::Summarization, "a", result("a"));
        cache.put("b", 0.5, CompressionStrategy::Summarization, "b", result("b"));
        cache.invalidate_item("a");
        assert_eq!(cache.len(), 1);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn hit_rate_computation() {
        let mut cache = CompressionCache::new(10);
        assert_eq!(cache.stats().hit_rate, 0.0);
        cache.put("a", 0.5, CompressionStrategy::Summarization, "a", result("a"));
        cache.get("a", 0.5, CompressionStrategy::Summarization, "a");
        cache.get("z", 0.5, CompressionStrategy::Summarization, "z");
        assert!((cache.stats().hit_rate - 0.5).abs() < 1e-9);
    }
}
