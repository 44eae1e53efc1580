//! The compression strategy library.
//!
//! Four interchangeable text-shrinking strategies share one contract:
//! `(text, target_ratio) -> CompressionResult`. Quality is approximated by
//! cheap word and line heuristics, never language understanding.
//!
//! | Strategy | Keeps |
//! |---|---|
//! | [`Summarization`](CompressionStrategy::Summarization) | best sentences, original order |
//! | [`KeywordExtraction`](CompressionStrategy::KeywordExtraction) | a bag of top keywords |
//! | [`SemanticClustering`](CompressionStrategy::SemanticClustering) | one digest per group of similar paragraphs |
//! | [`ProgressiveDetail`](CompressionStrategy::ProgressiveDetail) | structurally important lines |
//!
//! [`ContextCompressor`] picks a strategy per item type, caches results,
//! and compresses batches with bounded concurrency. The content-aware
//! layer lives in [`enhanced`].
//!
//! Every result honours monotonicity: if a strategy would not shrink the
//! text, the original is echoed back with `success: false`.

mod cache;
mod cluster;
pub mod detect;
pub mod enhanced;
mod keywords;
mod progressive;
mod summarize;
pub(crate) mod text;
mod transforms;

pub use cache::{CacheStats, CompressionCache};
pub use cluster::cluster_compress;
pub use detect::{ContentCategory, detect_content};
pub use enhanced::{EnhancedCompression, EnhancedCompressor, TextCompressor, meets_target};
pub use keywords::extract_keywords;
pub use progressive::progressive_detail;
pub use summarize::summarize;

use crate::config::CompressionConfig;
use crate::item::{ContentType, ContextItem, estimate_tokens};
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Key terms compared before and after compression.
const CONCEPT_COUNT: usize = 10;

/// The four base strategies.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionStrategy {
    Summarization,
    KeywordExtraction,
    SemanticClustering,
    ProgressiveDetail,
}

impl CompressionStrategy {
    pub const ALL: [CompressionStrategy; 4] = [
        Self::Summarization,
        Self::KeywordExtraction,
        Self::SemanticClustering,
        Self::ProgressiveDetail,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Summarization => "summarization",
            Self::KeywordExtraction => "keyword-extraction",
            Self::SemanticClustering => "semantic-clustering",
            Self::ProgressiveDetail => "progressive-detail",
        }
    }

    /// Run this strategy.
    pub fn compress(self, text: &str, target_ratio: f64) -> CompressionResult {
        match self {
            Self::Summarization => summarize(text, target_ratio),
            Self::KeywordExtraction => extract_keywords(text, target_ratio),
            Self::SemanticClustering => cluster_compress(text, target_ratio),
            Self::ProgressiveDetail => progressive_detail(text, target_ratio),
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for CompressionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.label() == s)
            .ok_or_else(|| format!("unknown compression strategy '{s}'"))
    }
}

/// Default per-type policy.
///
/// Conversation is summarized; code is clustered when longer than the
/// configured threshold and keyword-extracted otherwise; errors are
/// keyword-extracted; file listings get progressive detail; everything
/// else uses the configured default.
pub fn select_strategy(
    content_type: ContentType,
    content_chars: usize,
    config: &CompressionConfig,
) -> CompressionStrategy {
    match content_type {
        ContentType::Conversation => CompressionStrategy::Summarization,
        ContentType::Code if content_chars > config.clustering_threshold_chars => {
            CompressionStrategy::SemanticClustering
        }
        ContentType::Code | ContentType::Error => CompressionStrategy::KeywordExtraction,
        ContentType::File => CompressionStrategy::ProgressiveDetail,
        ContentType::ProjectState | ContentType::System | ContentType::UserPreference => {
            config.default_strategy
        }
    }
}

/// Tokens a strategy may emit: `floor(original × ratio)`, at least one.
pub(crate) fn token_budget(original_tokens: usize, target_ratio: f64) -> usize {
    ((original_tokens as f64 * target_ratio.clamp(0.0, 1.0)).floor() as usize).max(1)
}

// ── Result ─────────────────────────────────────────────────────────

/// Outcome of one compression attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionResult {
    pub success: bool,
    pub original: String,
    pub compressed: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// `compressed_tokens / original_tokens`; 1.0 for empty input.
    pub compression_ratio: f64,
    pub preserved_concepts: Vec<String>,
    /// Heuristic estimate in `[0, 1]`.
    pub information_loss: f64,
    pub strategy: String,
}

impl CompressionResult {
    /// A failed attempt that echoes `original` unchanged.
    pub fn unchanged(original: &str, strategy: &str) -> Self {
        let tokens = estimate_tokens(original);
        Self {
            success: false,
            original: original.to_string(),
            compressed: original.to_string(),
            original_tokens: tokens,
            compressed_tokens: tokens,
            compression_ratio: 1.0,
            preserved_concepts: text::top_keywords(original, CONCEPT_COUNT),
            information_loss: 0.0,
            strategy: strategy.to_string(),
        }
    }

    /// Build a result from the before and after texts.
    ///
    /// Falls back to [`unchanged`](Self::unchanged) when the output is
    /// empty or not smaller than the input.
    pub fn from_texts(original: &str, compressed: String, strategy: &str) -> Self {
        let original_tokens = estimate_tokens(original);
        let compressed_tokens = estimate_tokens(&compressed);
        if original_tokens == 0 || compressed_tokens == 0 || compressed_tokens >= original_tokens {
            return Self::unchanged(original, strategy);
        }
        let ratio = compressed_tokens as f64 / original_tokens as f64;
        let concepts = text::top_keywords(original, CONCEPT_COUNT);
        let preserved = text::retained_concepts(&concepts, &compressed);
        let retention = if concepts.is_empty() {
            1.0
        } else {
            preserved.len() as f64 / concepts.len() as f64
        };
        Self {
            success: true,
            original: original.to_string(),
            compressed,
            original_tokens,
            compressed_tokens,
            compression_ratio: ratio,
            information_loss: (0.5 * (1.0 - ratio) + 0.5 * (1.0 - retention)).clamp(0.0, 1.0),
            preserved_concepts: preserved,
            strategy: strategy.to_string(),
        }
    }

    pub fn tokens_saved(&self) -> usize {
        self.original_tokens.saturating_sub(self.compressed_tokens)
    }
}

// ── Compressor ─────────────────────────────────────────────────────

/// Item-level compression: per-type strategy choice, result caching, and
/// bounded-concurrency batches.
#[derive(Debug)]
pub struct ContextCompressor {
    config: Mutex<CompressionConfig>,
    cache: Mutex<CompressionCache>,
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        let cache = CompressionCache::new(config.cache_capacity);
        Self {
            config: Mutex::new(config),
            cache: Mutex::new(cache),
        }
    }

    pub fn config(&self) -> CompressionConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration. Cached results are dropped.
    pub fn set_config(&self, config: CompressionConfig) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = CompressionCache::new(config.cache_capacity);
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        tracing::debug!("[compress] configuration changed, cache invalidated");
    }

    /// The strategy [`compress_item`](Self::compress_item) would use.
    pub fn strategy_for(&self, item: &ContextItem) -> CompressionStrategy {
        let config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        select_strategy(item.content_type, item.content.chars().count(), &config)
    }

    /// Compress one item's content with its type's strategy, using the
    /// cache when the same content was compressed at the same ratio.
    pub fn compress_item(&self, item: &ContextItem, target_ratio: f64) -> CompressionResult {
        let strategy = self.strategy_for(item);
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&item.id, target_ratio, strategy, &item.content)
        {
            tracing::trace!("[compress] cache hit for {}", item.id);
            return hit;
        }
        let result = strategy.compress(&item.content, target_ratio);
        tracing::debug!(
            "[compress] {} via {strategy}: {} -> {} tokens",
            item.id,
            result.original_tokens,
            result.compressed_tokens
        );
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).put(
            &item.id,
            target_ratio,
            strategy,
            &item.content,
            result.clone(),
        );
        result
    }

    /// Compress many items, at most `batch_concurrency` at a time.
    ///
    /// Items are processed in fixed-size groups: each group fans out onto
    /// blocking tasks and is fully gathered before the next starts. Output
    /// order matches input order.
    pub async fn compress_batch(
        self: &Arc<Self>,
        items: &[ContextItem],
        target_ratio: f64,
    ) -> Vec<(String, CompressionResult)> {
        let group = self.config().batch_concurrency.max(1);
        let mut out = Vec::with_capacity(items.len());
        for chunk in items.chunks(group) {
            let handles = chunk.iter().cloned().map(|item| {
                let this = Arc::clone(self);
                tokio::task::spawn_blocking(move || {
                    let result = this.compress_item(&item, target_ratio);
                    (item, result)
                })
            });
            let joined = join_all(handles).await;
            for (item, joined) in chunk.iter().zip(joined) {
                match joined {
                    Ok((done, result)) => out.push((done.id, result)),
                    Err(e) => {
                        tracing::warn!("[compress] task for {} failed: {e}", item.id);
                        out.push((
                            item.id.clone(),
                            CompressionResult::unchanged(&item.content, "failed"),
                        ));
                    }
                }
            }
        }
        out
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).stats()
    }

    pub fn invalidate_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).invalidate_all();
    }

    /// Drop cached results for one item.
    pub fn invalidate_item(&self, id: &str) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).invalidate_item(id);
    }
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prose(n: usize) -> String {
        (0..n)
            .map(|i| format!("Sentence number {i} talks about the cache and the parser in detail."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn selection_policy() {
        let config = CompressionConfig::default();
        assert_eq!(
            select_strategy(ContentType::Conversation, 10, &config),
            CompressionStrategy::Summarization
        );
        assert_eq!(
            select_strategy(ContentType::Code, 2_001, &config),
            CompressionStrategy::SemanticClustering
        );
        assert_eq!(
            select_strategy(ContentType::Code, 2_000, &config),
            CompressionStrategy::KeywordExtraction
        );
        assert_eq!(
            select_strategy(ContentType::Error, 10, &config),
            CompressionStrategy::KeywordExtraction
        );
        assert_eq!(
            select_strategy(ContentType::File, 10, &config),
            CompressionStrategy::ProgressiveDetail
        );
        assert_eq!(
            select_strategy(ContentType::System, 10, &config),
            config.default_strategy
        );
    }

    #[test]
    fn strategy_labels_round_trip_through_from_str() {
        for strategy in CompressionStrategy::ALL {
            assert_eq!(strategy.label().parse::<CompressionStrategy>().unwrap(), strategy);
        }
        assert!("zip".parse::<CompressionStrategy>().is_err());
    }

    #[test]
    fn every_strategy_is_monotonic() {
        let text = prose(12);
        for strategy in CompressionStrategy::ALL {
            let result = strategy.compress(&text, 0.5);
            assert!(
                result.compressed_tokens <= result.original_tokens,
                "{strategy} grew the text"
            );
            if !result.success {
                assert_eq!(result.compressed, text);
            }
        }
    }

    #[test]
    fn no_gain_echoes_original() {
        let result = CompressionResult::from_texts("short", "short but longer".into(), "x");
        assert!(!result.success);
        assert_eq!(result.compressed, "short");
        assert_eq!(result.compression_ratio, 1.0);
    }

    #[test]
    fn information_loss_is_bounded() {
        let text = prose(8);
        let result = summarize(&text, 0.3);
        assert!((0.0..=1.0).contains(&result.information_loss));
        assert!(result.information_loss > 0.0);
    }

    #[test]
    fn compress_item_uses_cache() {
        let compressor = ContextCompressor::default();
        let item = ContextItem::new("c1", prose(6), ContentType::Conversation);
        let a = compressor.compress_item(&item, 0.5);
        let b = compressor.compress_item(&item, 0.5);
        assert_eq!(a, b);
        let stats = compressor.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn config_change_invalidates_cache() {
        let compressor = ContextCompressor::default();
        let item = ContextItem::new("c1", prose(6), ContentType::Conversation);
        compressor.compress_item(&item, 0.5);
        compressor.set_config(CompressionConfig {
            default_strategy: CompressionStrategy::KeywordExtraction,
            ..Default::default()
        });
        assert_eq!(compressor.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let compressor = Arc::new(ContextCompressor::default());
        let items: Vec<ContextItem> = (0..12)
            .map(|i| ContextItem::new(format!("i{i}"), prose(4), ContentType::Conversation))
            .collect();
        let results = compressor.compress_batch(&items, 0.5).await;
        assert_eq!(results.len(), 12);
        for (i, (id, result)) in results.iter().enumerate() {
            assert_eq!(id, &format!("i{i}"));
            assert!(result.compressed_tokens <= result.original_tokens);
        }
    }
}
