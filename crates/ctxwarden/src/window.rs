//! The context window manager.
//!
//! [`ContextWindowManager`] owns one [`ContextWindow`]: it admits items into
//! sections, evicts and compresses when a section overflows, and rebalances
//! section capacities from observed usage.
//!
//! Token totals are always recomputed from the items after a mutation
//! rather than adjusted incrementally, so they cannot drift.
//!
//! # Example
//!
//! ```ignore
//! let mut manager = ContextWindowManager::new("main", &WardenConfig::default())?;
//! let item = ContextItem::new("msg-1", "How do I fix the build?", ContentType::Conversation);
//! if !manager.add(item) {
//!     tracing::warn!("window full");
//! }
//! let stats = manager.get_allocation_stats();
//! ```

use crate::compression::{CompressionStrategy, ContextCompressor};
use crate::config::{WardenConfig, WindowConfig};
use crate::error::Result;
use crate::item::{ContentType, ContextItem, ContextWindow, SectionName, estimate_tokens};
use crate::prioritizer::{ContextPrioritizer, Dependents, PrioritizationResult, WorkingContext};
use crate::session::SessionContext;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;

/// A window manager shared between callers and the background services.
pub type SharedWindow = Arc<tokio::sync::Mutex<ContextWindowManager>>;

/// Share of the blended weight taken from the static ratio.
const STATIC_WEIGHT: f64 = 0.7;
/// Below this utilization a section may give up capacity.
const CAN_EXPAND_BELOW: f64 = 0.3;

/// What one `optimize_section` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionOptimization {
    pub removed: Vec<String>,
    pub compressed: Vec<String>,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

impl SectionOptimization {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.compressed.is_empty()
    }
}

/// Per-section line of [`AllocationStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionAllocation {
    pub name: SectionName,
    pub allocated: usize,
    pub used: usize,
    pub items: usize,
    pub utilization: f64,
    pub needs_compression: bool,
    pub can_expand: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationStats {
    pub sections: Vec<SectionAllocation>,
    pub total_allocated: usize,
    pub total_used: usize,
    pub wasted_tokens: usize,
    /// `(allocated − wasted) / allocated`.
    pub efficiency_score: f64,
}

/// Owns a window and enforces its budget.
#[derive(Debug)]
pub struct ContextWindowManager {
    id: String,
    config: WindowConfig,
    target_ratio: f64,
    window: ContextWindow,
    prioritizer: ContextPrioritizer,
    compressor: Arc<ContextCompressor>,
    working_context: WorkingContext,
    usage_samples: BTreeMap<SectionName, VecDeque<usize>>,
    last_optimization: Option<Instant>,
}

impl ContextWindowManager {
    /// Build a manager from a validated configuration.
    pub fn new(id: impl Into<String>, config: &WardenConfig) -> Result<Self> {
        config.validate()?;
        let window_config = config.window.clone();
        let window = ContextWindow::new(window_config.total_tokens, |name| {
            window_config.initial_capacity(name)
        });
        Ok(Self {
            id: id.into(),
            target_ratio: config.compression.target_ratio,
            window,
            prioritizer: ContextPrioritizer::new(config.prioritizer.clone()),
            compressor: Arc::new(ContextCompressor::new(config.compression.clone())),
            working_context: WorkingContext::default(),
            usage_samples: BTreeMap::new(),
            last_optimization: None,
            config: window_config,
        })
    }

    /// Share a compressor (and its cache) with other managers.
    pub fn with_compressor(mut self, compressor: Arc<ContextCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Wrap in the shared handle the background services expect.
    pub fn into_shared(self) -> SharedWindow {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn compressor(&self) -> &Arc<ContextCompressor> {
        &self.compressor
    }

    pub fn get_current_window(&self) -> &ContextWindow {
        &self.window
    }

    /// Default section for an item type.
    pub fn section_for_type(&self, content_type: ContentType) -> SectionName {
        content_type.default_section()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.window.items().any(|(_, i)| i.id == id)
    }

    pub fn item(&self, id: &str) -> Option<&ContextItem> {
        self.window.items().find(|(_, i)| i.id == id).map(|(_, i)| i)
    }

    // ── Admission ──────────────────────────────────────────────────

    /// Add an item to the section its type maps to.
    pub fn add(&mut self, item: ContextItem) -> bool {
        let section = self.section_for_type(item.content_type);
        self.add_item(section, item)
    }

    /// Admit `item` into `section`.
    ///
    /// Optimizes the section first if the item would not fit, and rejects
    /// (returns `false`) if it still does not. Never panics or errors.
    pub fn add_item(&mut self, section: SectionName, item: ContextItem) -> bool {
        if self.contains(&item.id) {
            tracing::warn!("[window] {}: duplicate item id {}", self.id, item.id);
            return false;
        }
        if !self.fits(section, item.token_count) {
            let outcome = self.optimize_section(section);
            tracing::debug!(
                "[window] {}: {section} optimized for admission ({} -> {} tokens)",
                self.id,
                outcome.tokens_before,
                outcome.tokens_after
            );
            if !self.fits(section, item.token_count) {
                tracing::warn!(
                    "[window] {}: rejected {} ({} tokens), {section} is full",
                    self.id,
                    item.id,
                    item.token_count
                );
                return false;
            }
        }

        let Some(target) = self.window.section_mut(section) else {
            return false;
        };
        target.items.push(item);
        self.recompute_totals();
        self.record_usage(section);

        if self.any_section_over_threshold() && self.optimization_due() {
            self.optimize_window();
        }
        true
    }

    fn fits(&self, section: SectionName, tokens: usize) -> bool {
        self.window
            .section(section)
            .is_some_and(|s| s.tokens + tokens <= s.max_tokens)
    }

    fn optimization_due(&self) -> bool {
        self.last_optimization
            .is_none_or(|at| at.elapsed() >= self.config.min_optimization_interval())
    }

    fn any_section_over_threshold(&self) -> bool {
        self.window
            .sections
            .values()
            .any(|s| s.utilization() > self.config.compression_threshold)
    }

    fn record_usage(&mut self, section: SectionName) {
        let tokens = self.window.section(section).map_or(0, |s| s.tokens);
        let samples = self.usage_samples.entry(section).or_default();
        samples.push_back(tokens);
        while samples.len() > self.config.usage_sample_window {
            samples.pop_front();
        }
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Remove items by id from any section. Returns how many were removed.
    pub fn remove_items<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        let ids: HashSet<&str> = ids.iter().map(AsRef::as_ref).collect();
        let mut removed = 0;
        for section in self.window.sections.values_mut() {
            let before = section.items.len();
            section.items.retain(|i| !ids.contains(i.id.as_str()));
            removed += before - section.items.len();
        }
        for id in &ids {
            self.prioritizer.forget(id);
        }
        self.recompute_totals();
        removed
    }

    /// Keep only items whose id is in `keep`. Returns how many were removed.
    pub fn retain_items(&mut self, keep: &HashSet<String>) -> usize {
        let doomed: Vec<String> = self
            .window
            .items()
            .filter(|(_, i)| !keep.contains(&i.id))
            .map(|(_, i)| i.id.clone())
            .collect();
        self.remove_items(&doomed)
    }

    /// Replace an item's content with a compressed version.
    ///
    /// Refused (returns `false`) if the item is unknown or the new content
    /// would not be smaller.
    pub fn replace_item_content(&mut self, id: &str, content: String, strategy: &str) -> bool {
        let tokens = estimate_tokens(&content);
        let mut replaced = false;
        for section in self.window.sections.values_mut() {
            if let Some(item) = section.item_mut(id)
                && tokens < item.token_count
            {
                item.apply_compression(content, tokens, strategy);
                replaced = true;
                break;
            }
        }
        if replaced {
            self.compressor.invalidate_item(id);
            self.recompute_totals();
        }
        replaced
    }

    /// Mark an item as used now.
    pub fn touch_item(&mut self, id: &str) -> bool {
        let now = Utc::now();
        for section in self.window.sections.values_mut() {
            if let Some(item) = section.item_mut(id) {
                item.last_accessed_at = now;
                self.prioritizer.record_interaction(id);
                return true;
            }
        }
        false
    }

    pub fn set_working_context(&mut self, context: WorkingContext) {
        self.working_context = context;
    }

    pub fn working_context(&self) -> &WorkingContext {
        &self.working_context
    }

    /// Recompute every total from the items.
    pub fn recompute_totals(&mut self) {
        self.window.recompute();
    }

    /// Whether token accounting is consistent and every section respects
    /// the configured floor.
    pub fn check_invariants(&self) -> bool {
        self.window.is_consistent()
            && self
                .window
                .sections
                .values()
                .all(|s| s.max_tokens >= self.config.min_tokens_per_section)
    }

    // ── Optimization ───────────────────────────────────────────────

    /// Score a section's items without acting on them. Dependents are
    /// counted across the whole window.
    pub fn prioritize_section(&self, section: SectionName) -> PrioritizationResult {
        let items = self.window.section(section).map_or(&[][..], |s| &s.items[..]);
        let dependents = Dependents::count(self.window.items().map(|(_, i)| i));
        self.prioritizer
            .prioritize_with(items, &dependents, &self.working_context, Utc::now())
    }

    /// Remove everything the prioritizer drops from a section, re-scoring
    /// until nothing more goes. An item kept only by dependents removed in
    /// the same round goes in the next one.
    ///
    /// Returns the removed ids and the plan for what is left.
    pub fn evict_section(&mut self, section: SectionName) -> (Vec<String>, PrioritizationResult) {
        let mut removed = Vec::new();
        loop {
            let plan = self.prioritize_section(section);
            if plan.to_remove.is_empty() {
                return (removed, plan);
            }
            self.remove_items(&plan.to_remove);
            removed.extend(plan.to_remove);
        }
    }

    /// Evict from the section (see [`evict_section`](Self::evict_section))
    /// and compress what is left of its `to_compress` items one at a time.
    ///
    /// Items already compressed are not compressed again, so a second call
    /// with no new items changes nothing.
    pub fn optimize_section(&mut self, section: SectionName) -> SectionOptimization {
        let tokens_before = self.window.section(section).map_or(0, |s| s.tokens);
        let (removed, plan) = self.evict_section(section);
        let mut outcome = SectionOptimization {
            removed,
            tokens_before,
            ..Default::default()
        };

        for id in &plan.to_compress {
            let Some(item) = self
                .window
                .section(section)
                .and_then(|s| s.item(id))
                .filter(|i| !i.is_compressed())
                .cloned()
            else {
                continue;
            };
            let result = self.compressor.compress_item(&item, self.target_ratio);
            if !result.success || result.compressed_tokens >= item.token_count {
                tracing::debug!("[window] {}: {} did not compress", self.id, item.id);
                continue;
            }
            if let Some(target) = self.window.section_mut(section).and_then(|s| s.item_mut(id)) {
                target.apply_compression(result.compressed, result.compressed_tokens, &result.strategy);
                outcome.compressed.push(id.clone());
            }
        }

        self.recompute_totals();
        outcome.tokens_after = self.window.section(section).map_or(0, |s| s.tokens);
        if !outcome.is_noop() {
            tracing::info!(
                "[window] {}: optimized {section}: removed {}, compressed {}, {} -> {} tokens",
                self.id,
                outcome.removed.len(),
                outcome.compressed.len(),
                outcome.tokens_before,
                outcome.tokens_after
            );
        }
        outcome
    }

    /// Optimize every section over the threshold, then rebalance
    /// capacities if dynamic allocation is on.
    pub fn optimize_window(&mut self) -> Vec<(SectionName, SectionOptimization)> {
        let over: Vec<SectionName> = self
            .window
            .sections
            .values()
            .filter(|s| s.utilization() > self.config.compression_threshold)
            .map(|s| s.name)
            .collect();
        let outcomes: Vec<(SectionName, SectionOptimization)> = over
            .into_iter()
            .map(|name| (name, self.optimize_section(name)))
            .collect();
        if self.config.dynamic_allocation {
            self.reallocate();
        }
        self.last_optimization = Some(Instant::now());
        outcomes
    }

    /// Recompute section capacities from a 70/30 blend of the static ratio
    /// and observed usage, never below the floor.
    pub fn reallocate(&mut self) {
        let available = self.config.available_budget() as f64;
        let mut weights: BTreeMap<SectionName, f64> = BTreeMap::new();
        for section in self.window.sections.values() {
            let static_ratio = self.config.allocation.get(section.name);
            let observed = match self.usage_samples.get(&section.name) {
                Some(samples) if !samples.is_empty() && section.max_tokens > 0 => {
                    let avg = samples.iter().sum::<usize>() as f64 / samples.len() as f64;
                    avg / section.max_tokens as f64
                }
                _ => static_ratio,
            };
            weights.insert(
                section.name,
                STATIC_WEIGHT * static_ratio + (1.0 - STATIC_WEIGHT) * observed,
            );
        }
        let sum: f64 = weights.values().sum();
        if sum <= 0.0 {
            return;
        }
        for (name, weight) in weights {
            if let Some(section) = self.window.section_mut(name) {
                let share = (available * weight / sum).floor() as usize;
                section.max_tokens = share.max(self.config.min_tokens_per_section);
            }
        }
        tracing::debug!("[window] {}: section capacities rebalanced", self.id);
    }

    // ── Reporting ──────────────────────────────────────────────────

    pub fn get_allocation_stats(&self) -> AllocationStats {
        let sections: Vec<SectionAllocation> = self
            .window
            .sections
            .values()
            .map(|s| {
                let utilization = s.utilization();
                SectionAllocation {
                    name: s.name,
                    allocated: s.max_tokens,
                    used: s.tokens,
                    items: s.items.len(),
                    utilization,
                    needs_compression: utilization > self.config.compression_threshold,
                    can_expand: utilization < CAN_EXPAND_BELOW,
                }
            })
            .collect();
        let total_allocated: usize = sections.iter().map(|s| s.allocated).sum();
        let total_used: usize = sections.iter().map(|s| s.used).sum();
        let wasted_tokens: usize = sections
            .iter()
            .map(|s| s.allocated.saturating_sub(s.used))
            .sum();
        let efficiency_score = if total_allocated == 0 {
            0.0
        } else {
            (total_allocated - wasted_tokens) as f64 / total_allocated as f64
        };
        AllocationStats {
            sections,
            total_allocated,
            total_used,
            wasted_tokens,
            efficiency_score,
        }
    }

    /// Strategy the compressor would pick for an item.
    pub fn strategy_for(&self, item: &ContextItem) -> CompressionStrategy {
        self.compressor.strategy_for(item)
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Admit every item of a saved session. Returns how many were admitted.
    pub fn restore_session(&mut self, session: &SessionContext) -> usize {
        let mut admitted = 0;
        for item in &session.items {
            if self.add(item.clone()) {
                admitted += 1;
            }
        }
        tracing::info!(
            "[window] {}: restored {admitted}/{} items from session {}",
            self.id,
            session.items.len(),
            session.session_id
        );
        admitted
    }

    /// Capture the current items as a session.
    pub fn export_session(
        &self,
        session_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> SessionContext {
        let items = self.window.items().map(|(_, i)| i.clone()).collect();
        SessionContext::new(session_id, project_path).with_items(items)
    }
}
