//! Recovery when a compression strategy fails.
//!
//! The [`FallbackSystem`] classifies the triggering error by keyword,
//! walks the matching ladder of cheaper strategies, and stops at the first
//! attempt that lands within tolerance of the requested ratio. When the
//! whole ladder fails it can run an emergency purge that keeps only
//! critical content. If even that is impossible the original items come
//! back unchanged with `success: false`.

use crate::compression::text::{collapse_whitespace, truncate_chars};
use crate::compression::{CompressionResult, CompressionStrategy, token_budget};
use crate::config::FallbackConfig;
use crate::item::{CHARS_PER_TOKEN, ContextItem, Priority, estimate_tokens};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{LazyLock, Mutex};
use std::time::Instant;

/// Appended to every item cut down by the emergency purge.
pub const EMERGENCY_MARKER: &str = "\n[EMERGENCY TRUNCATION]";
/// High-priority items kept by the purge when nothing is critical.
const PURGE_HIGH_PRIORITY_KEEP: usize = 3;
/// Chunk size for chunk-based processing.
const CHUNK_CHARS: usize = 4_000;

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]{1,200}>|[{}\[\]\x22`]").expect("valid regex literal"));

// ── Classification ─────────────────────────────────────────────────

/// What kind of failure triggered the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    MemoryExhaustion,
    Timeout,
    AlgorithmFailure,
    UnknownContentType,
    ParsingError,
    InvalidInput,
    ResourceLimit,
    Unexpected,
}

impl ErrorClass {
    /// Classify an error message by keyword. The first matching class in
    /// a fixed order wins.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["memory", "heap", "allocation", "oom"]) {
            Self::MemoryExhaustion
        } else if has(&["timeout", "timed out", "deadline"]) {
            Self::Timeout
        } else if has(&["unknown content", "unsupported", "unrecognized"]) {
            Self::UnknownContentType
        } else if has(&["parse", "syntax", "malformed"]) {
            Self::ParsingError
        } else if has(&["invalid", "empty content"]) {
            Self::InvalidInput
        } else if has(&["resource", "limit exceeded", "quota", "too large"]) {
            Self::ResourceLimit
        } else if has(&["algorithm", "insufficient compression", "no improvement"]) {
            Self::AlgorithmFailure
        } else {
            Self::Unexpected
        }
    }

    /// The ordered strategies tried for this class.
    pub fn ladder(self) -> &'static [FallbackStrategy] {
        use FallbackStrategy::*;
        match self {
            Self::MemoryExhaustion => &[
                ChunkBased,
                MemoryOptimized,
                SimpleCompression,
                WhitespaceCompression,
            ],
            Self::Timeout => &[
                SimpleCompression,
                WhitespaceCompression,
                TextTruncation,
                LineRemoval,
            ],
            Self::AlgorithmFailure => &[
                SentenceExtraction,
                KeywordOnly,
                SimpleCompression,
                TextTruncation,
            ],
            Self::UnknownContentType => &[
                PlainText,
                SimpleCompression,
                WhitespaceCompression,
                TextTruncation,
            ],
            Self::ParsingError => &[PlainText, LineRemoval, WhitespaceCompression, TextTruncation],
            Self::InvalidInput => &[InputSanitization, SimpleCompression, TextTruncation],
            Self::ResourceLimit => &[ChunkBased, SimpleCompression, TextTruncation],
            Self::Unexpected => &[
                SimpleCompression,
                WhitespaceCompression,
                SentenceExtraction,
                TextTruncation,
            ],
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MemoryExhaustion => "memory-exhaustion",
            Self::Timeout => "timeout",
            Self::AlgorithmFailure => "algorithm-failure",
            Self::UnknownContentType => "unknown-content-type",
            Self::ParsingError => "parsing-error",
            Self::InvalidInput => "invalid-input",
            Self::ResourceLimit => "resource-limit",
            Self::Unexpected => "unexpected",
        };
        f.write_str(label)
    }
}

// ── Strategies ─────────────────────────────────────────────────────

/// One rung of a fallback ladder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    ChunkBased,
    MemoryOptimized,
    SimpleCompression,
    WhitespaceCompression,
    TextTruncation,
    LineRemoval,
    SentenceExtraction,
    KeywordOnly,
    PlainText,
    InputSanitization,
    LowPriorityRemoval,
    OldestContentRemoval,
    AggressiveTruncation,
    EmergencyPurge,
}

/// Rungs appended to every ladder in emergency mode.
pub const EMERGENCY_RUNGS: [FallbackStrategy; 3] = [
    FallbackStrategy::LowPriorityRemoval,
    FallbackStrategy::OldestContentRemoval,
    FallbackStrategy::AggressiveTruncation,
];

impl FallbackStrategy {
    pub fn label(self) -> &'static str {
        match self {
            Self::ChunkBased => "chunk-based",
            Self::MemoryOptimized => "memory-optimized",
            Self::SimpleCompression => "simple-compression",
            Self::WhitespaceCompression => "whitespace-compression",
            Self::TextTruncation => "text-truncation",
            Self::LineRemoval => "line-removal",
            Self::SentenceExtraction => "sentence-extraction",
            Self::KeywordOnly => "keyword-only",
            Self::PlainText => "plain-text",
            Self::InputSanitization => "input-sanitization",
            Self::LowPriorityRemoval => "low-priority-removal",
            Self::OldestContentRemoval => "oldest-content-removal",
            Self::AggressiveTruncation => "aggressive-truncation",
            Self::EmergencyPurge => "emergency-purge",
        }
    }

    /// Whether the strategy drops whole items rather than rewriting text.
    pub fn removes_items(self) -> bool {
        matches!(self, Self::LowPriorityRemoval | Self::OldestContentRemoval)
    }

    /// Run the strategy over `items`. Content is only replaced when it
    /// gets smaller; critical items are never dropped.
    fn apply(self, items: &[ContextItem], target_ratio: f64) -> Vec<ContextItem> {
        match self {
            Self::LowPriorityRemoval => items
                .iter()
                .filter(|i| !i.priority.is_expendable())
                .cloned()
                .collect(),
            Self::OldestContentRemoval => remove_oldest(items, target_ratio),
            Self::AggressiveTruncation => items
                .iter()
                .map(|item| {
                    if item.priority == Priority::Critical {
                        return item.clone();
                    }
                    rewrite(item, self, |text| {
                        truncate_to_tokens(text, token_budget(estimate_tokens(text), target_ratio * 0.5))
                    })
                })
                .collect(),
            Self::EmergencyPurge => items.to_vec(),
            text_rung => items
                .iter()
                .map(|item| rewrite(item, text_rung, |text| text_rung.rewrite_text(text, target_ratio)))
                .collect(),
        }
    }

    fn rewrite_text(self, text: &str, ratio: f64) -> String {
        let budget = token_budget(estimate_tokens(text), ratio);
        match self {
            Self::SimpleCompression => {
                CompressionStrategy::Summarization
                    .compress(&collapse_whitespace(text), ratio)
                    .compressed
            }
            Self::SentenceExtraction => CompressionStrategy::Summarization.compress(text, ratio).compressed,
            Self::KeywordOnly => CompressionStrategy::KeywordExtraction.compress(text, ratio).compressed,
            Self::MemoryOptimized => CompressionStrategy::ProgressiveDetail.compress(text, ratio).compressed,
            Self::WhitespaceCompression => collapse_whitespace(text),
            Self::TextTruncation => truncate_to_tokens(text, budget),
            Self::LineRemoval => remove_lines(text, budget),
            Self::PlainText => {
                let plain = collapse_whitespace(&MARKUP.replace_all(text, " "));
                CompressionStrategy::Summarization.compress(&plain, ratio).compressed
            }
            Self::InputSanitization => {
                let clean: String = text
                    .chars()
                    .filter(|c| !c.is_control() || *c == '\n')
                    .collect();
                truncate_to_tokens(&collapse_whitespace(&clean), budget)
            }
            Self::ChunkBased => chunked(text, ratio),
            _ => text.to_string(),
        }
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn rewrite(item: &ContextItem, strategy: FallbackStrategy, f: impl Fn(&str) -> String) -> ContextItem {
    let mut out = item.clone();
    let text = f(&item.content);
    let tokens = estimate_tokens(&text);
    if !text.trim().is_empty() && tokens < item.token_count {
        out.apply_compression(text, tokens, &format!("fallback-{strategy}"));
    }
    out
}

fn truncate_to_tokens(text: &str, tokens: usize) -> String {
    let max_chars = tokens * CHARS_PER_TOKEN;
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = truncate_chars(text, max_chars.saturating_sub(3));
    format!("{}...", cut.trim_end())
}

/// Drop blank lines, then keep leading lines while they fit.
fn remove_lines(text: &str, budget: usize) -> String {
    let mut out = Vec::new();
    let mut used = 0;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let cost = estimate_tokens(line).max(1);
        if used + cost > budget {
            break;
        }
        used += cost;
        out.push(line);
    }
    out.join("\n")
}

/// Summarize fixed-size chunks independently.
fn chunked(text: &str, ratio: f64) -> String {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHUNK_CHARS)
        .map(|chunk| {
            let chunk: String = chunk.iter().collect();
            CompressionStrategy::Summarization.compress(&chunk, ratio).compressed
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drop the oldest non-critical items until the total fits the target.
fn remove_oldest(items: &[ContextItem], ratio: f64) -> Vec<ContextItem> {
    let total: usize = items.iter().map(|i| i.token_count).sum();
    let budget = token_budget(total, ratio);
    let mut by_age: Vec<&ContextItem> = items
        .iter()
        .filter(|i| i.priority != Priority::Critical)
        .collect();
    by_age.sort_by_key(|i| i.last_activity());

    let mut remaining = total;
    let mut dropped: HashSet<&str> = HashSet::new();
    for item in by_age {
        if remaining <= budget {
            break;
        }
        remaining -= item.token_count;
        dropped.insert(item.id.as_str());
    }
    items
        .iter()
        .filter(|i| !dropped.contains(i.id.as_str()))
        .cloned()
        .collect()
}

// ── Results ────────────────────────────────────────────────────────

/// The outcome of a fallback pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackResult {
    #[serde(flatten)]
    pub result: CompressionResult,
    pub error_class: ErrorClass,
    /// The rung that succeeded, if any.
    pub fallback_strategy: Option<FallbackStrategy>,
    pub fallback_attempts: usize,
    pub fallback_errors: Vec<String>,
    pub emergency_measures_applied: bool,
    pub recovery_actions: Vec<String>,
    /// The surviving items with their final content. On failure these are
    /// the inputs, unchanged.
    pub items: Vec<ContextItem>,
}

impl FallbackResult {
    /// Ids present in `before` but missing from the result.
    pub fn removed_ids(&self, before: &[ContextItem]) -> Vec<String> {
        let kept: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        before
            .iter()
            .filter(|i| !kept.contains(i.id.as_str()))
            .map(|i| i.id.clone())
            .collect()
    }
}

/// Counters across every fallback pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    pub emergency_purges: u64,
    pub by_strategy: BTreeMap<FallbackStrategy, u64>,
}

fn joined(items: &[ContextItem]) -> String {
    items
        .iter()
        .map(|i| i.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn total_tokens(items: &[ContextItem]) -> usize {
    items.iter().map(|i| i.token_count).sum()
}

fn aggregate(before: &[ContextItem], after: &[ContextItem], strategy: &str) -> CompressionResult {
    let original_tokens = total_tokens(before);
    let compressed_tokens = total_tokens(after);
    let original = joined(before);
    if compressed_tokens >= original_tokens || original_tokens == 0 {
        return CompressionResult::unchanged(&original, strategy);
    }
    let compressed = joined(after);
    let mut result = CompressionResult::from_texts(&original, compressed.clone(), strategy);
    // Item-level accounting is authoritative over the re-estimated join.
    result.success = true;
    result.compressed = compressed;
    result.original_tokens = original_tokens;
    result.compressed_tokens = compressed_tokens;
    result.compression_ratio = compressed_tokens as f64 / original_tokens as f64;
    result
}

// ── System ─────────────────────────────────────────────────────────

/// Walks fallback ladders and runs the emergency purge.
#[derive(Debug, Default)]
pub struct FallbackSystem {
    config: FallbackConfig,
    stats: Mutex<FallbackStats>,
}

impl FallbackSystem {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(FallbackStats::default()),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn stats(&self) -> FallbackStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The rungs that would be tried for `class`, in order.
    ///
    /// Strategies with a configured priority run first (lowest value
    /// first), then the remaining ladder rungs in ladder order. The list
    /// is capped at `max_fallback_attempts`.
    pub fn plan(&self, class: ErrorClass, emergency: bool) -> Vec<FallbackStrategy> {
        let mut rungs: Vec<FallbackStrategy> = class.ladder().to_vec();
        if emergency {
            rungs.extend(EMERGENCY_RUNGS);
        }
        let priorities = &self.config.strategy_priorities;
        // Stable sort keeps ladder order among equals.
        rungs.sort_by_key(|s| priorities.get(s).map_or((1, 0), |&p| (0, p)));
        rungs.truncate(self.config.max_fallback_attempts);
        rungs
    }

    /// Recover from `error` for `items` at `target_ratio`.
    ///
    /// Never fails: the worst case echoes the inputs with `success: false`.
    pub async fn handle(
        &self,
        items: Vec<ContextItem>,
        target_ratio: f64,
        error: &str,
        emergency: bool,
    ) -> FallbackResult {
        let started = Instant::now();
        let class = ErrorClass::classify(error);
        let plan = self.plan(class, emergency);
        tracing::warn!(
            "[fallback] {} items, error class {class} ({error}), trying {} strategies",
            items.len(),
            plan.len()
        );
        self.bump(|s| s.invocations += 1);

        let mut errors = Vec::new();
        let mut attempts = 0;
        for strategy in plan {
            attempts += 1;
            match self.attempt(strategy, &items, target_ratio).await {
                Ok((result, after)) if self.within_tolerance(&result, target_ratio) => {
                    tracing::info!(
                        "[fallback] {strategy} succeeded: {} -> {} tokens in {:?}",
                        result.original_tokens,
                        result.compressed_tokens,
                        started.elapsed()
                    );
                    self.bump(|s| {
                        s.successes += 1;
                        *s.by_strategy.entry(strategy).or_default() += 1;
                    });
                    return FallbackResult {
                        result,
                        error_class: class,
                        fallback_strategy: Some(strategy),
                        fallback_attempts: attempts,
                        fallback_errors: errors,
                        emergency_measures_applied: EMERGENCY_RUNGS.contains(&strategy),
                        recovery_actions: vec![format!("applied {strategy}")],
                        items: after,
                    };
                }
                Ok((result, _)) => {
                    let msg = format!(
                        "{strategy}: ratio {:.2} misses target {target_ratio:.2}",
                        result.compression_ratio
                    );
                    tracing::warn!("[fallback] {msg}");
                    errors.push(msg);
                }
                Err(msg) => {
                    tracing::warn!("[fallback] {msg}");
                    errors.push(msg);
                }
            }
        }

        if self.config.enable_emergency_removal {
            attempts += 1;
            if let Some((result, after, actions)) = self.emergency_purge(&items, target_ratio) {
                tracing::warn!(
                    "[fallback] emergency purge kept {} of {} items ({} -> {} tokens)",
                    after.len(),
                    items.len(),
                    result.original_tokens,
                    result.compressed_tokens
                );
                self.bump(|s| {
                    s.successes += 1;
                    s.emergency_purges += 1;
                    *s.by_strategy.entry(FallbackStrategy::EmergencyPurge).or_default() += 1;
                });
                return FallbackResult {
                    result,
                    error_class: class,
                    fallback_strategy: Some(FallbackStrategy::EmergencyPurge),
                    fallback_attempts: attempts,
                    fallback_errors: errors,
                    emergency_measures_applied: true,
                    recovery_actions: actions,
                    items: after,
                };
            }
            errors.push("emergency-purge: nothing could be safely preserved".into());
        }

        tracing::error!(
            "[fallback] all {attempts} attempts failed, returning original content"
        );
        self.bump(|s| s.failures += 1);
        FallbackResult {
            result: CompressionResult::unchanged(&joined(&items), "fallback-failed"),
            error_class: class,
            fallback_strategy: None,
            fallback_attempts: attempts,
            fallback_errors: errors,
            emergency_measures_applied: false,
            recovery_actions: vec!["returned original content".into()],
            items,
        }
    }

    fn within_tolerance(&self, result: &CompressionResult, target_ratio: f64) -> bool {
        result.success
            && result.compression_ratio <= target_ratio * (1.0 + self.config.success_tolerance)
    }

    /// Run one rung on a blocking thread under the per-attempt timeout.
    async fn attempt(
        &self,
        strategy: FallbackStrategy,
        items: &[ContextItem],
        target_ratio: f64,
    ) -> std::result::Result<(CompressionResult, Vec<ContextItem>), String> {
        let owned = items.to_vec();
        let task = tokio::task::spawn_blocking(move || {
            let after = strategy.apply(&owned, target_ratio);
            let result = aggregate(&owned, &after, &format!("fallback-{strategy}"));
            (result, after)
        });
        match tokio::time::timeout(self.config.fallback_timeout(), task).await {
            Ok(Ok(done)) => Ok(done),
            Ok(Err(e)) => Err(format!("{strategy}: task failed: {e}")),
            Err(_) => Err(format!(
                "{strategy}: timed out after {} ms",
                self.config.fallback_timeout_ms
            )),
        }
    }

    /// Keep critical items (or, failing that, the most recent high-priority
    /// ones) and cut each to an even share of the preserved budget.
    fn emergency_purge(
        &self,
        items: &[ContextItem],
        target_ratio: f64,
    ) -> Option<(CompressionResult, Vec<ContextItem>, Vec<String>)> {
        let total = total_tokens(items);
        let mut kept: Vec<&ContextItem> = items
            .iter()
            .filter(|i| i.priority == Priority::Critical)
            .collect();
        let mut actions = Vec::new();
        if kept.is_empty() {
            kept = items.iter().filter(|i| i.priority == Priority::High).collect();
            kept.sort_by_key(|i| std::cmp::Reverse(i.last_activity()));
            kept.truncate(PURGE_HIGH_PRIORITY_KEEP);
            actions.push(format!("no critical items, kept {} high-priority", kept.len()));
        } else {
            actions.push(format!("kept {} critical items", kept.len()));
        }
        if kept.is_empty() {
            return None;
        }

        let preserved = target_ratio.max(self.config.min_preservation_ratio);
        let budget = (total as f64 * preserved).floor() as usize;
        let share = budget / kept.len();
        let marker_tokens = estimate_tokens(EMERGENCY_MARKER);
        if share <= marker_tokens {
            return None;
        }

        let mut after = Vec::with_capacity(kept.len());
        for item in kept {
            let mut out = item.clone();
            if item.token_count > share {
                let body_chars = (share - marker_tokens) * CHARS_PER_TOKEN;
                let content = format!(
                    "{}{EMERGENCY_MARKER}",
                    truncate_chars(&item.content, body_chars).trim_end()
                );
                let tokens = estimate_tokens(&content);
                out.apply_compression(content, tokens, FallbackStrategy::EmergencyPurge.label());
                actions.push(format!("truncated {}", item.id));
            }
            after.push(out);
        }
        actions.push(format!("removed {} items", items.len() - after.len()));
        let result = aggregate(items, &after, FallbackStrategy::EmergencyPurge.label());
        if !result.success {
            return None;
        }
        Some((result, after, actions))
    }

    fn bump(&self, f: impl FnOnce(&mut FallbackStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ContentType;

    fn prose_item(id: &str, priority: Priority) -> ContextItem {
        let text = (0..30)
            .map(|i| format!("The deploy step number {i} copies artifacts to the staging bucket."))
            .collect::<Vec<_>>()
            .join(" ");
        ContextItem::new(id, text, ContentType::Conversation).with_priority(priority)
    }

    #[test]
    fn classification_by_keyword() {
        assert_eq!(ErrorClass::classify("heap allocation failed"), ErrorClass::MemoryExhaustion);
        assert_eq!(ErrorClass::classify("compression timeout after 10 ms"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::classify("unknown content type: blob"), ErrorClass::UnknownContentType);
        assert_eq!(ErrorClass::classify("parse error: eof"), ErrorClass::ParsingError);
        assert_eq!(ErrorClass::classify("invalid input: empty content"), ErrorClass::InvalidInput);
        assert_eq!(ErrorClass::classify("resource limit exceeded: 5MB"), ErrorClass::ResourceLimit);
        assert_eq!(
            ErrorClass::classify("insufficient compression: achieved ratio 1.00"),
            ErrorClass::AlgorithmFailure
        );
        assert_eq!(ErrorClass::classify("something odd"), ErrorClass::Unexpected);
    }

    #[test]
    fn emergency_appends_removal_rungs() {
        let system = FallbackSystem::default();
        let plan = system.plan(ErrorClass::InvalidInput, true);
        assert_eq!(&plan[..3], ErrorClass::InvalidInput.ladder());
        assert_eq!(&plan[3..], &EMERGENCY_RUNGS);
    }

    #[test]
    fn configured_priorities_reorder_and_cap() {
        let mut config = FallbackConfig {
            max_fallback_attempts: 2,
            ..Default::default()
        };
        config
            .strategy_priorities
            .insert(FallbackStrategy::LineRemoval, 0);
        let plan = FallbackSystem::new(config).plan(ErrorClass::Timeout, false);
        assert_eq!(
            plan,
            vec![FallbackStrategy::LineRemoval, FallbackStrategy::SimpleCompression]
        );
    }

    #[test]
    fn text_rungs_never_grow_items() {
        let item = prose_item("a", Priority::Medium);
        for strategy in ErrorClass::Unexpected.ladder() {
            let out = strategy.apply(std::slice::from_ref(&item), 0.5);
            assert!(out[0].token_count <= item.token_count, "{strategy} grew the item");
        }
    }

    #[test]
    fn low_priority_removal_keeps_critical() {
        let items = vec![
            prose_item("c", Priority::Critical),
            prose_item("l", Priority::Low),
            prose_item("k", Priority::Cached),
        ];
        let out = FallbackStrategy::LowPriorityRemoval.apply(&items, 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "c");
    }

    #[tokio::test]
    async fn timeout_error_uses_timeout_ladder() {
        let system = FallbackSystem::default();
        let items = vec![prose_item("a", Priority::Medium)];
        let out = system.handle(items, 0.5, "compression timeout after 5000 ms", false).await;
        assert!(out.result.success);
        assert_eq!(out.error_class, ErrorClass::Timeout);
        assert!(ErrorClass::Timeout.ladder().contains(&out.fallback_strategy.unwrap()));
        assert!(out.result.compressed_tokens <= out.result.original_tokens);
    }

    #[tokio::test]
    async fn failure_echoes_original_content() {
        let config = FallbackConfig {
            enable_emergency_removal: false,
            ..Default::default()
        };
        let system = FallbackSystem::new(config);
        // Too short for any rung to shrink it.
        let items = vec![ContextItem::new("a", "ok", ContentType::Conversation)];
        let out = system.handle(items.clone(), 0.5, "weird", false).await;
        assert!(!out.result.success);
        assert_eq!(out.fallback_strategy, None);
        assert_eq!(out.items, items);
        assert_eq!(out.result.compressed, "ok");
        assert_eq!(system.stats().failures, 1);
    }
}
