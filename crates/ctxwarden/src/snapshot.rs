//! Aggregate token usage across window managers.
//!
//! Both the auto-compression manager and the token monitor work from a
//! [`TokenUsageSnapshot`]: the usage of every section of every registered
//! manager at one instant, plus the compression opportunities seen and a
//! growth estimate from recent history.

use crate::compression::{CompressionStrategy, select_strategy};
use crate::config::CompressionConfig;
use crate::item::{ContextWindow, SectionName};
use crate::window::SharedWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Snapshots used for the growth estimate.
const GROWTH_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionUsage {
    pub manager_id: String,
    pub section: SectionName,
    pub tokens: usize,
    pub max_tokens: usize,
    pub items: usize,
    pub utilization: f64,
}

/// Tokens a compression pass over one section would likely free.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionOpportunity {
    pub manager_id: String,
    pub section: SectionName,
    pub current_tokens: usize,
    pub estimated_savings: usize,
    pub recommended_strategy: CompressionStrategy,
    /// Share of the section not yet compressed, in `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSnapshot {
    pub at: DateTime<Utc>,
    pub total_tokens: usize,
    pub max_limit: usize,
    pub utilization_ratio: f64,
    pub sections: Vec<SectionUsage>,
    pub opportunities: Vec<CompressionOpportunity>,
    /// Tokens per minute over the recent history; negative when shrinking.
    pub projected_growth: f64,
}

impl TokenUsageSnapshot {
    /// A snapshot of nothing against `max_limit`.
    pub fn empty(max_limit: usize) -> Self {
        Self {
            at: Utc::now(),
            total_tokens: 0,
            max_limit,
            utilization_ratio: 0.0,
            sections: Vec::new(),
            opportunities: Vec::new(),
            projected_growth: 0.0,
        }
    }

    /// Minutes until the limit at the projected growth rate, or `None`
    /// when usage is not growing.
    pub fn minutes_until_limit(&self) -> Option<f64> {
        if self.projected_growth <= 0.0 {
            return None;
        }
        let headroom = self.max_limit.saturating_sub(self.total_tokens) as f64;
        Some(headroom / self.projected_growth)
    }

    pub fn potential_savings(&self) -> usize {
        self.opportunities.iter().map(|o| o.estimated_savings).sum()
    }
}

/// A point-in-time copy of one manager's window.
#[derive(Debug, Clone)]
pub struct ManagerView {
    pub id: String,
    pub window: ContextWindow,
}

/// Copy every registered window. Each manager is locked only while its
/// window is cloned.
pub async fn gather_views(managers: &[(String, SharedWindow)]) -> Vec<ManagerView> {
    let mut views = Vec::with_capacity(managers.len());
    for (id, manager) in managers {
        let guard = manager.lock().await;
        views.push(ManagerView {
            id: id.clone(),
            window: guard.get_current_window().clone(),
        });
    }
    views
}

/// Build a snapshot from `views`.
///
/// Without an explicit `max_limit` the limit is the sum of the windows'
/// capacities.
pub fn build_snapshot(
    views: &[ManagerView],
    max_limit: Option<usize>,
    history: &VecDeque<TokenUsageSnapshot>,
    compression: &CompressionConfig,
    target_ratio: f64,
    now: DateTime<Utc>,
) -> TokenUsageSnapshot {
    let max_limit = max_limit
        .unwrap_or_else(|| views.iter().map(|v| v.window.total_tokens).sum())
        .max(1);
    let mut sections = Vec::new();
    let mut opportunities = Vec::new();
    let mut total_tokens = 0;

    for view in views {
        total_tokens += view.window.used_tokens;
        for section in view.window.sections.values() {
            sections.push(SectionUsage {
                manager_id: view.id.clone(),
                section: section.name,
                tokens: section.tokens,
                max_tokens: section.max_tokens,
                items: section.items.len(),
                utilization: section.utilization(),
            });

            let fresh: Vec<_> = section.items.iter().filter(|i| !i.is_compressed()).collect();
            let fresh_tokens: usize = fresh.iter().map(|i| i.token_count).sum();
            let savings = (fresh_tokens as f64 * (1.0 - target_ratio)).floor() as usize;
            if savings == 0 {
                continue;
            }
            let mut votes: BTreeMap<CompressionStrategy, usize> = BTreeMap::new();
            for item in &fresh {
                let strategy =
                    select_strategy(item.content_type, item.content.chars().count(), compression);
                *votes.entry(strategy).or_default() += item.token_count;
            }
            let recommended_strategy = votes
                .into_iter()
                .max_by_key(|&(_, tokens)| tokens)
                .map_or(compression.default_strategy, |(s, _)| s);
            opportunities.push(CompressionOpportunity {
                manager_id: view.id.clone(),
                section: section.name,
                current_tokens: section.tokens,
                estimated_savings: savings,
                recommended_strategy,
                confidence: fresh_tokens as f64 / section.tokens.max(1) as f64,
            });
        }
    }
    opportunities.sort_by(|a, b| b.estimated_savings.cmp(&a.estimated_savings));

    TokenUsageSnapshot {
        at: now,
        total_tokens,
        max_limit,
        utilization_ratio: total_tokens as f64 / max_limit as f64,
        sections,
        opportunities,
        projected_growth: growth_rate(history, total_tokens, now),
    }
}

/// Tokens per minute from the oldest of the last few snapshots to now.
pub fn growth_rate(history: &VecDeque<TokenUsageSnapshot>, current: usize, now: DateTime<Utc>) -> f64 {
    let start = history.len().saturating_sub(GROWTH_WINDOW);
    let Some(oldest) = history.get(start) else {
        return 0.0;
    };
    let minutes = (now - oldest.at).num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    (current as f64 - oldest.total_tokens as f64) / minutes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::item::{ContentType, ContextItem};
    use crate::window::ContextWindowManager;
    use chrono::Duration;

    fn at(total: usize, when: DateTime<Utc>) -> TokenUsageSnapshot {
        TokenUsageSnapshot {
            at: when,
            total_tokens: total,
            ..TokenUsageSnapshot::empty(10_000)
        }
    }

    #[test]
    fn growth_from_history() {
        let now = Utc::now();
        let history: VecDeque<_> = [at(1_000, now - Duration::minutes(10))].into();
        let rate = growth_rate(&history, 3_000, now);
        assert!((rate - 200.0).abs() < 1e-6);
        assert_eq!(growth_rate(&VecDeque::new(), 3_000, now), 0.0);
    }

    #[test]
    fn minutes_until_limit() {
        let mut snap = at(8_000, Utc::now());
        snap.projected_growth = 100.0;
        assert_eq!(snap.minutes_until_limit(), Some(20.0));
        snap.projected_growth = -5.0;
        assert_eq!(snap.minutes_until_limit(), None);
    }

    #[tokio::test]
    async fn snapshot_aggregates_managers() {
        let config = WardenConfig::default().with_total_tokens(10_000);
        let mut a = ContextWindowManager::new("a", &config).unwrap();
        a.add(ContextItem::new("x", "y", ContentType::Code).with_token_count(1_000));
        let b = ContextWindowManager::new("b", &config).unwrap();
        let managers = vec![
            ("a".to_string(), a.into_shared()),
            ("b".to_string(), b.into_shared()),
        ];
        let views = gather_views(&managers).await;
        let snap = build_snapshot(
            &views,
            None,
            &VecDeque::new(),
            &config.compression,
            0.6,
            Utc::now(),
        );
        assert_eq!(snap.total_tokens, 1_000);
        assert_eq!(snap.max_limit, 20_000);
        assert!((snap.utilization_ratio - 0.05).abs() < 1e-9);
        assert_eq!(snap.sections.len(), 10);
        assert_eq!(snap.opportunities.len(), 1);
        assert_eq!(snap.opportunities[0].estimated_savings, 400);
        assert_eq!(
            snap.opportunities[0].recommended_strategy,
            CompressionStrategy::KeywordExtraction
        );
    }
}
