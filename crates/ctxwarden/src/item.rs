//! The item model: context items, the five sections that hold them, and the
//! window that owns the sections.
//!
//! This module is pure data plus the bookkeeping helpers that keep token
//! totals honest. All policy (admission, prioritization, compression) lives
//! in [`window`](crate::window) and friends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Characters per token before density adjustment.
pub const CHARS_PER_TOKEN: usize = 4;

/// Symbol density above which text is treated as code (+20% tokens).
const CODE_SYMBOL_DENSITY: f64 = 0.08;

/// Whitespace share above which text is treated as sparse (-20% tokens).
const SPARSE_WHITESPACE_RATIO: f64 = 0.35;

const CODE_SYMBOLS: &[char] = &[
    '{', '}', '(', ')', '[', ']', ';', '=', '<', '>', '&', '|', ':', '"', '\'', '`',
];

/// Estimate the token count of `text`.
///
/// Starts from `ceil(chars / 4)` and adjusts by up to 20% for density:
/// symbol-heavy code costs more per character, markdown slightly more,
/// whitespace-heavy text less.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    let base = chars.div_ceil(CHARS_PER_TOKEN) as f64;
    (base * density_factor(text, chars)).ceil() as usize
}

fn density_factor(text: &str, chars: usize) -> f64 {
    let symbols = text.chars().filter(|c| CODE_SYMBOLS.contains(c)).count();
    if symbols as f64 / chars as f64 > CODE_SYMBOL_DENSITY {
        return 1.2;
    }
    let markdown_lines = text
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with('#') || t.starts_with("- ") || t.starts_with("* ") || t.starts_with("```")
        })
        .count();
    if markdown_lines > 0 && markdown_lines * 5 >= text.lines().count() {
        return 1.1;
    }
    let whitespace = text.chars().filter(|c| c.is_whitespace()).count();
    if whitespace as f64 / chars as f64 > SPARSE_WHITESPACE_RATIO {
        return 0.8;
    }
    1.0
}

// ── Enumerations ───────────────────────────────────────────────────

/// What kind of content an item holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Conversation,
    Code,
    File,
    ProjectState,
    Error,
    System,
    UserPreference,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        Self::Conversation,
        Self::Code,
        Self::File,
        Self::ProjectState,
        Self::Error,
        Self::System,
        Self::UserPreference,
    ];

    /// Stable kebab-case label, identical to the serialized form.
    pub fn label(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Code => "code",
            Self::File => "file",
            Self::ProjectState => "project-state",
            Self::Error => "error",
            Self::System => "system",
            Self::UserPreference => "user-preference",
        }
    }

    /// The section an item of this type lands in when the caller doesn't
    /// pick one.
    pub fn default_section(self) -> SectionName {
        match self {
            Self::Conversation | Self::Error => SectionName::Conversation,
            Self::Code | Self::File => SectionName::Code,
            Self::ProjectState => SectionName::Project,
            Self::System => SectionName::System,
            Self::UserPreference => SectionName::Memory,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Retention priority of an item or section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Cached,
}

impl Priority {
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Cached => "cached",
        }
    }

    /// Low and cached items are always eligible for compression.
    pub fn is_expendable(self) -> bool {
        matches!(self, Self::Low | Self::Cached)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The five fixed partitions of a context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionName {
    System,
    Conversation,
    Code,
    Project,
    Memory,
}

impl SectionName {
    pub const ALL: [SectionName; 5] = [
        Self::System,
        Self::Conversation,
        Self::Code,
        Self::Project,
        Self::Memory,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Conversation => "conversation",
            Self::Code => "code",
            Self::Project => "project",
            Self::Memory => "memory",
        }
    }

    /// Default priority tier for the section.
    pub fn default_priority(self) -> Priority {
        match self {
            Self::System => Priority::Critical,
            Self::Conversation | Self::Code => Priority::High,
            Self::Project => Priority::Medium,
            Self::Memory => Priority::Low,
        }
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── ContextItem ────────────────────────────────────────────────────

/// A unit of working memory: opaque text plus bookkeeping.
///
/// Created by ingestion code outside the core. Only compression (content
/// and token count replaced) and deletion mutate it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub priority: Priority,
    /// Prior relevance in `[0, 1]`.
    pub relevance_score: f64,
    pub token_count: usize,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Metadata key set on items whose content has been compressed.
pub const META_COMPRESSED: &str = "compressed";
/// Metadata key holding the token count before the first compression.
pub const META_ORIGINAL_TOKENS: &str = "originalTokens";
/// Metadata key naming the strategy that produced the current content.
pub const META_STRATEGY: &str = "compressionStrategy";

impl ContextItem {
    /// Create an item with medium priority, neutral relevance, and a token
    /// estimate computed from `content`.
    pub fn new(id: impl Into<String>, content: impl Into<String>, content_type: ContentType) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            token_count: estimate_tokens(&content),
            content,
            created_at: now,
            last_accessed_at: now,
            content_type,
            priority: Priority::Medium,
            relevance_score: 0.5,
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = score.clamp(0.0, 1.0);
        self
    }

    /// Override the token estimate (for callers that count exactly).
    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = tokens;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Backdate the item. Sets both creation and last access.
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.last_accessed_at = at;
        self
    }

    /// The later of creation and last access; ages are measured from here.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.created_at.max(self.last_accessed_at)
    }

    /// Whether the content has already been through compression.
    pub fn is_compressed(&self) -> bool {
        self.metadata
            .get(META_COMPRESSED)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// Replace the content with a compressed version and record provenance.
    ///
    /// The original token count is recorded only on the first compression
    /// so effectiveness metrics compare against the real original.
    pub fn apply_compression(&mut self, content: String, tokens: usize, strategy: &str) {
        if !self.metadata.contains_key(META_ORIGINAL_TOKENS) {
            self.metadata
                .insert(META_ORIGINAL_TOKENS.into(), self.token_count.into());
        }
        self.metadata.insert(META_COMPRESSED.into(), true.into());
        self.metadata.insert(META_STRATEGY.into(), strategy.into());
        self.content = content;
        self.token_count = tokens;
    }

    /// Token count before any compression, if the item was compressed.
    pub fn original_tokens(&self) -> Option<usize> {
        self.metadata
            .get(META_ORIGINAL_TOKENS)
            .and_then(serde_json::Value::as_u64)
            .map(|n| n as usize)
    }
}

// ── ContextSection ─────────────────────────────────────────────────

/// A named partition with its own soft capacity.
///
/// Invariant: `tokens == items.iter().map(|i| i.token_count).sum()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSection {
    pub name: SectionName,
    pub tokens: usize,
    pub max_tokens: usize,
    /// Insertion order.
    pub items: Vec<ContextItem>,
    pub priority: Priority,
}

impl ContextSection {
    pub fn new(name: SectionName, max_tokens: usize) -> Self {
        Self {
            name,
            tokens: 0,
            max_tokens,
            items: Vec::new(),
            priority: name.default_priority(),
        }
    }

    /// Usage as a fraction of capacity. An empty-capacity section with
    /// content reports `1.0`.
    pub fn utilization(&self) -> f64 {
        if self.max_tokens == 0 {
            return if self.tokens > 0 { 1.0 } else { 0.0 };
        }
        self.tokens as f64 / self.max_tokens as f64
    }

    /// Recompute `tokens` from scratch.
    pub fn recompute_tokens(&mut self) {
        self.tokens = self.items.iter().map(|i| i.token_count).sum();
    }

    pub fn item(&self, id: &str) -> Option<&ContextItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn item_mut(&mut self, id: &str) -> Option<&mut ContextItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    /// Whether `tokens` matches the item sum.
    pub fn is_consistent(&self) -> bool {
        self.tokens == self.items.iter().map(|i| i.token_count).sum::<usize>()
    }
}

// ── ContextWindow ──────────────────────────────────────────────────

/// The full token budget and its five sections.
///
/// Invariants: `used_tokens == Σ section.tokens` and
/// `available_tokens == total_tokens - used_tokens` (saturating).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindow {
    pub total_tokens: usize,
    pub used_tokens: usize,
    pub available_tokens: usize,
    pub sections: BTreeMap<SectionName, ContextSection>,
}

impl ContextWindow {
    /// Build a window with one empty section per [`SectionName`], each
    /// sized by `capacity(name)`.
    pub fn new(total_tokens: usize, capacity: impl Fn(SectionName) -> usize) -> Self {
        let sections = SectionName::ALL
            .iter()
            .map(|&name| (name, ContextSection::new(name, capacity(name))))
            .collect();
        Self {
            total_tokens,
            used_tokens: 0,
            available_tokens: total_tokens,
            sections,
        }
    }

    pub fn section(&self, name: SectionName) -> Option<&ContextSection> {
        self.sections.get(&name)
    }

    pub fn section_mut(&mut self, name: SectionName) -> Option<&mut ContextSection> {
        self.sections.get_mut(&name)
    }

    /// Recompute every section total and the window totals from scratch.
    pub fn recompute(&mut self) {
        for section in self.sections.values_mut() {
            section.recompute_tokens();
        }
        self.used_tokens = self.sections.values().map(|s| s.tokens).sum();
        self.available_tokens = self.total_tokens.saturating_sub(self.used_tokens);
    }

    /// All items across sections, tagged with their section.
    pub fn items(&self) -> impl Iterator<Item = (SectionName, &ContextItem)> {
        self.sections
            .values()
            .flat_map(|s| s.items.iter().map(move |i| (s.name, i)))
    }

    pub fn item_count(&self) -> usize {
        self.sections.values().map(|s| s.items.len()).sum()
    }

    /// Whether both accounting invariants hold.
    pub fn is_consistent(&self) -> bool {
        self.sections.values().all(ContextSection::is_consistent)
            && self.used_tokens == self.sections.values().map(|s| s.tokens).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn prose_is_about_four_chars_per_token() {
        let text = "the quick brown fox jumps over the lazy dog again";
        let tokens = estimate_tokens(text);
        assert_eq!(tokens, text.len().div_ceil(4));
    }

    #[test]
    fn code_costs_more_than_prose_of_equal_length() {
        let code = "fn main() { let x = vec![1, 2, 3]; if x.len() > 2 { println!(\"{x:?}\"); } }";
        let prose: String = "a".repeat(code.len());
        assert!(estimate_tokens(code) > estimate_tokens(&prose));
        assert!(estimate_tokens(code) <= (code.len().div_ceil(4) as f64 * 1.2).ceil() as usize);
    }

    #[test]
    fn new_item_estimates_tokens() {
        let item = ContextItem::new("a", "x".repeat(400), ContentType::Conversation);
        assert_eq!(item.token_count, 100);
        assert_eq!(item.priority, Priority::Medium);
    }

    #[test]
    fn apply_compression_keeps_first_original_count() {
        let mut item = ContextItem::new("a", "x".repeat(400), ContentType::Conversation);
        item.apply_compression("short".into(), 2, "summarization");
        item.apply_compression("s".into(), 1, "keyword-extraction");
        assert!(item.is_compressed());
        assert_eq!(item.original_tokens(), Some(100));
        assert_eq!(item.token_count, 1);
    }

    #[test]
    fn window_recompute_restores_invariants() {
        let mut window = ContextWindow::new(1000, |_| 200);
        let section = window.section_mut(SectionName::Code).unwrap();
        section
            .items
            .push(ContextItem::new("a", "x".repeat(40), ContentType::Code));
        assert!(!window.is_consistent());
        window.recompute();
        assert!(window.is_consistent());
        assert_eq!(window.used_tokens, 10);
        assert_eq!(window.available_tokens, 990);
    }

    #[test]
    fn serde_uses_kebab_case_labels() {
        let json = serde_json::to_string(&ContentType::UserPreference).unwrap();
        assert_eq!(json, "\"user-preference\"");
        let item = ContextItem::new("a", "hi", ContentType::ProjectState);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "project-state");
        assert!(value.get("tokenCount").is_some());
    }

    #[test]
    fn default_sections_route_by_type() {
        assert_eq!(ContentType::File.default_section(), SectionName::Code);
        assert_eq!(ContentType::UserPreference.default_section(), SectionName::Memory);
    }
}
