//! Item scoring and partitioning.
//!
//! [`ContextPrioritizer`] scores each item from four factors and sorts the
//! items into critical, remove, compress, and retain buckets.
//!
//! | Factor | Formula |
//! |---|---|
//! | recency | `exp(−age / (max_age / 3))` |
//! | relevance | type boost + 0.6 × prior + 0.4 × overlap with the working context, + 0.1 per matching tag, + 0.1 for metadata overlap |
//! | interaction | `ln(min(count, 100) + 1) / ln(101)` |
//! | dependency | share of dependents (bounded) + 0.3 × own dependencies / 5 |
//!
//! Bucket precedence per item: critical (critical priority, score above
//! 0.8, or error/user-preference type); then remove (low score or too old,
//! unless others depend on it, which demotes it to compress); then compress
//! (score under 0.6 or an expendable priority); otherwise retain.

use crate::compression::text::{jaccard, word_set};
use crate::config::PrioritizerConfig;
use crate::item::{ContentType, ContextItem, Priority};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

const MS_PER_HOUR: f64 = 3_600_000.0;
const INTERACTION_CAP: u32 = 100;
const MAX_COUNTED_DEPENDENCIES: usize = 5;

/// What the assistant is currently working on.
#[derive(Debug, Clone, Default)]
pub struct WorkingContext {
    /// Free text (task description, open file names, recent query).
    pub focus: String,
    pub tags: BTreeSet<String>,
}

impl WorkingContext {
    pub fn new(focus: impl Into<String>) -> Self {
        Self {
            focus: focus.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// The action an item was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Critical,
    Remove,
    Compress,
    Retain,
}

/// Per-factor sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreFactors {
    pub recency: f64,
    pub relevance: f64,
    pub interaction: f64,
    pub dependency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredItem {
    pub id: String,
    pub score: f64,
    pub factors: ScoreFactors,
    pub bucket: Bucket,
}

/// Outcome of one prioritization pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizationResult {
    /// Every item, best score first.
    pub prioritized: Vec<ScoredItem>,
    pub critical: Vec<String>,
    pub to_compress: Vec<String>,
    pub to_remove: Vec<String>,
}

impl PrioritizationResult {
    pub fn bucket_of(&self, id: &str) -> Option<Bucket> {
        self.prioritized.iter().find(|s| s.id == id).map(|s| s.bucket)
    }
}

/// How many items depend on each item.
///
/// Count over everything that may hold a dependency (a whole window), not
/// just the items being scored, so that a section's items keep dependents
/// living in other sections.
#[derive(Debug, Clone, Default)]
pub struct Dependents {
    counts: HashMap<String, usize>,
    bound: f64,
}

impl Dependents {
    pub fn count<'a>(items: impl IntoIterator<Item = &'a ContextItem>) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut total = 0;
        for item in items {
            total += 1;
            for dep in &item.dependencies {
                *counts.entry(dep.clone()).or_default() += 1;
            }
        }
        Self {
            counts,
            bound: total as f64 * 0.1,
        }
    }

    /// Items depending on `id`.
    pub fn of(&self, id: &str) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }

    fn bound(&self) -> f64 {
        self.bound.max(10.0)
    }
}

/// Scores items and tracks how often each is used.
#[derive(Debug, Clone, Default)]
pub struct ContextPrioritizer {
    config: PrioritizerConfig,
    interactions: HashMap<String, u32>,
}

impl ContextPrioritizer {
    pub fn new(config: PrioritizerConfig) -> Self {
        Self {
            config,
            interactions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PrioritizerConfig {
        &self.config
    }

    /// Count one use of an item.
    pub fn record_interaction(&mut self, id: &str) {
        let count = self.interactions.entry(id.to_string()).or_default();
        *count = count.saturating_add(1);
    }

    pub fn interaction_count(&self, id: &str) -> u32 {
        self.interactions.get(id).copied().unwrap_or(0)
    }

    /// Drop tracking state for removed items.
    pub fn forget(&mut self, id: &str) {
        self.interactions.remove(id);
    }

    /// Score `items` against `context` and bucket them, counting
    /// dependents among `items` only.
    pub fn prioritize(
        &self,
        items: &[ContextItem],
        context: &WorkingContext,
        now: DateTime<Utc>,
    ) -> PrioritizationResult {
        self.prioritize_with(items, &Dependents::count(items), context, now)
    }

    /// Score `items` with dependents counted elsewhere.
    pub fn prioritize_with(
        &self,
        items: &[ContextItem],
        dependents: &Dependents,
        context: &WorkingContext,
        now: DateTime<Utc>,
    ) -> PrioritizationResult {
        let context_words = word_set(&context.focus);
        let mut result = PrioritizationResult::default();
        for item in items {
            let factors = ScoreFactors {
                recency: self.recency(item, now),
                relevance: self.relevance(item, context, &context_words),
                interaction: interaction_factor(self.interaction_count(&item.id)),
                dependency: dependency_factor(
                    dependents.of(&item.id),
                    dependents.bound(),
                    item.dependencies.len(),
                ),
            };
            let score = self.combine(&factors);
            let bucket = self.categorize(item, score, &factors, now);
            tracing::trace!(
                "[prioritizer] {} score={score:.3} bucket={bucket:?}",
                item.id
            );
            match bucket {
                Bucket::Critical => result.critical.push(item.id.clone()),
                Bucket::Remove => result.to_remove.push(item.id.clone()),
                Bucket::Compress => result.to_compress.push(item.id.clone()),
                Bucket::Retain => {}
            }
            result.prioritized.push(ScoredItem {
                id: item.id.clone(),
                score,
                factors,
                bucket,
            });
        }
        result
            .prioritized
            .sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        result
    }

    fn combine(&self, f: &ScoreFactors) -> f64 {
        let w = &self.config.weights;
        (w.recency * f.recency
            + w.relevance * f.relevance
            + w.interaction * f.interaction
            + w.dependency * f.dependency)
            .clamp(0.0, 1.0)
    }

    fn categorize(&self, item: &ContextItem, score: f64, f: &ScoreFactors, now: DateTime<Utc>) -> Bucket {
        if item.priority == Priority::Critical
            || score > self.config.critical_score
            || matches!(item.content_type, ContentType::Error | ContentType::UserPreference)
        {
            return Bucket::Critical;
        }
        if score < self.config.min_relevance_threshold || self.age_hours(item, now) > self.config.max_age_hours {
            if f.dependency >= self.config.dependency_protection {
                return Bucket::Compress;
            }
            return Bucket::Remove;
        }
        if score < self.config.compress_score || item.priority.is_expendable() {
            return Bucket::Compress;
        }
        Bucket::Retain
    }

    fn age_hours(&self, item: &ContextItem, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - item.last_activity()).num_milliseconds().max(0) as f64;
        age_ms / MS_PER_HOUR
    }

    fn recency(&self, item: &ContextItem, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - item.last_activity()).num_milliseconds().max(0) as f64;
        let scale = self.config.max_age_hours * MS_PER_HOUR / 3.0;
        if scale <= 0.0 {
            return 0.0;
        }
        (-age_ms / scale).exp()
    }

    fn relevance(&self, item: &ContextItem, context: &WorkingContext, context_words: &HashSet<String>) -> f64 {
        let mut score = type_boost(item.content_type) + 0.6 * item.relevance_score;
        if !context_words.is_empty() {
            score += 0.4 * jaccard(&word_set(&item.content), context_words);
        }
        score += 0.1 * item.tags.intersection(&context.tags).count() as f64;
        if !context_words.is_empty() && !item.metadata.is_empty() {
            let meta_text = item
                .metadata
                .values()
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            if word_set(&meta_text).iter().any(|w| context_words.contains(w)) {
                score += 0.1;
            }
        }
        score.clamp(0.0, 1.0)
    }
}

fn type_boost(content_type: ContentType) -> f64 {
    match content_type {
        ContentType::Error => 0.3,
        ContentType::UserPreference => 0.25,
        ContentType::System => 0.2,
        ContentType::Code => 0.15,
        ContentType::ProjectState | ContentType::File => 0.1,
        ContentType::Conversation => 0.05,
    }
}

fn interaction_factor(count: u32) -> f64 {
    let capped = count.min(INTERACTION_CAP) as f64;
    (capped + 1.0).ln() / (INTERACTION_CAP as f64 + 1.0).ln()
}

fn dependency_factor(dependents: usize, bound: f64, own_dependencies: usize) -> f64 {
    let depended_on = (dependents as f64).min(bound) / bound;
    let depends = 0.3 * own_dependencies.min(MAX_COUNTED_DEPENDENCIES) as f64
        / MAX_COUNTED_DEPENDENCIES as f64;
    (depended_on + depends).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(id: &str) -> ContextItem {
        ContextItem::new(id, "plain notes about the build", ContentType::Conversation)
    }

    #[test]
    fn critical_priority_wins_even_with_low_score() {
        let now = Utc::now();
        let old = item("c")
            .with_priority(Priority::Critical)
            .with_relevance(0.0)
            .with_created_at(now - Duration::hours(100));
        let prioritizer = ContextPrioritizer::default();
        let result = prioritizer.prioritize(&[old], &WorkingContext::default(), now);
        assert!(result.prioritized[0].score < 0.3);
        assert_eq!(result.critical, vec!["c".to_string()]);
        assert!(result.to_remove.is_empty());
    }

    #[test]
    fn error_and_preferences_are_critical() {
        let now = Utc::now();
        let items = vec![
            ContextItem::new("e", "stack overflow", ContentType::Error).with_relevance(0.0),
            ContextItem::new("p", "use tabs", ContentType::UserPreference).with_relevance(0.0),
        ];
        let result = ContextPrioritizer::default().prioritize(&items, &WorkingContext::default(), now);
        assert_eq!(result.critical.len(), 2);
    }

    #[test]
    fn stale_items_are_removed() {
        let now = Utc::now();
        let stale = item("s").with_created_at(now - Duration::hours(48));
        let result =
            ContextPrioritizer::default().prioritize(&[stale], &WorkingContext::default(), now);
        assert_eq!(result.to_remove, vec!["s".to_string()]);
    }

    #[test]
    fn depended_on_items_are_compressed_not_removed() {
        let now = Utc::now();
        let stale = item("base").with_created_at(now - Duration::hours(48));
        let mut items = vec![stale];
        for i in 0..4 {
            items.push(item(&format!("user{i}")).with_dependency("base"));
        }
        let result =
            ContextPrioritizer::default().prioritize(&items, &WorkingContext::default(), now);
        assert_eq!(result.bucket_of("base"), Some(Bucket::Compress));
    }

    #[test]
    fn dependents_outside_the_scored_items_protect() {
        let now = Utc::now();
        let base = item("base").with_created_at(now - Duration::hours(48));
        let users: Vec<ContextItem> = (0..4)
            .map(|i| item(&format!("user{i}")).with_dependency("base"))
            .collect();
        let dependents = Dependents::count(users.iter().chain([&base]));
        assert_eq!(dependents.of("base"), 4);

        let prioritizer = ContextPrioritizer::default();
        let alone = prioritizer.prioritize(std::slice::from_ref(&base), &WorkingContext::default(), now);
        assert_eq!(alone.bucket_of("base"), Some(Bucket::Remove));
        let with_window =
            prioritizer.prioritize_with(&[base], &dependents, &WorkingContext::default(), now);
        assert_eq!(with_window.bucket_of("base"), Some(Bucket::Compress));
    }

    #[test]
    fn fresh_relevant_item_is_retained() {
        let now = Utc::now();
        let mut prioritizer = ContextPrioritizer::default();
        for _ in 0..20 {
            prioritizer.record_interaction("r");
        }
        let relevant = ContextItem::new("r", "parser cache invalidation", ContentType::Code)
            .with_priority(Priority::High)
            .with_relevance(1.0)
            .with_tag("parser");
        let context = WorkingContext::new("parser cache invalidation").with_tag("parser");
        let result = prioritizer.prioritize(&[relevant], &context, now);
        assert!(matches!(
            result.bucket_of("r"),
            Some(Bucket::Retain) | Some(Bucket::Critical)
        ));
    }

    #[test]
    fn low_priority_is_compressed() {
        let now = Utc::now();
        let low = ContextItem::new("l", "parser", ContentType::Code)
            .with_priority(Priority::Low)
            .with_relevance(0.5);
        let result = ContextPrioritizer::default().prioritize(&[low], &WorkingContext::new("parser"), now);
        // High enough to escape removal, but the priority asks for compression.
        assert!(result.prioritized[0].score >= 0.6);
        assert_eq!(result.bucket_of("l"), Some(Bucket::Compress));
    }

    #[test]
    fn prioritized_is_sorted_descending() {
        let now = Utc::now();
        let items = vec![
            item("a").with_relevance(0.1),
            item("b").with_relevance(0.9),
            item("c").with_relevance(0.5),
        ];
        let result = ContextPrioritizer::default().prioritize(&items, &WorkingContext::default(), now);
        let scores: Vec<f64> = result.prioritized.iter().map(|s| s.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(result.prioritized[0].id, "b");
    }

    #[test]
    fn factor_formulas() {
        assert_eq!(interaction_factor(0), 0.0);
        assert!((interaction_factor(100) - 1.0).abs() < 1e-9);
        assert!((interaction_factor(500) - 1.0).abs() < 1e-9);
        assert!((dependency_factor(10, 10.0, 5) - 1.0).abs() < 1e-9);
        assert!((dependency_factor(3, 10.0, 0) - 0.3).abs() < 1e-9);
    }
}
