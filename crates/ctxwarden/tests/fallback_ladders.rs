//! Fallback classification, ladder order, and the emergency purge.

use ctxwarden::config::FallbackConfig;
use ctxwarden::fallback::{EMERGENCY_MARKER, ErrorClass, FallbackStrategy, FallbackSystem};
use ctxwarden::prelude::*;

fn prose_item(id: &str, priority: Priority) -> ContextItem {
    let text = (0..25)
        .map(|i| format!("Replica {i} of the cache layer rebuilt its index after the failover."))
        .collect::<Vec<_>>()
        .join(" ");
    ContextItem::new(id, text, ContentType::Conversation).with_priority(priority)
}

#[tokio::test]
async fn timeout_errors_walk_the_timeout_ladder() {
    let system = FallbackSystem::default();
    let plan = system.plan(ErrorClass::classify("request timed out"), false);
    assert_eq!(plan[0], FallbackStrategy::SimpleCompression);

    let timeout_rungs = [
        FallbackStrategy::SimpleCompression,
        FallbackStrategy::WhitespaceCompression,
        FallbackStrategy::TextTruncation,
        FallbackStrategy::LineRemoval,
    ];
    let items = vec![prose_item("a", Priority::Medium), prose_item("b", Priority::Medium)];
    let out = system
        .handle(items, 0.5, "compression timeout after 5000 ms", false)
        .await;
    let used = out.fallback_strategy.expect("a rung should succeed");
    assert!(timeout_rungs.contains(&used), "unexpected rung {used}");
    assert!(out.result.success);
    assert!(out.result.compression_ratio <= 0.5 * 1.2);
    assert!(!out.emergency_measures_applied);
}

#[tokio::test]
async fn emergency_purge_keeps_only_critical_items() {
    let mut config = FallbackConfig {
        max_fallback_attempts: 1,
        min_preservation_ratio: 0.1,
        ..Default::default()
    };
    // Whitespace collapsing cannot shrink single-spaced prose, so the
    // ladder fails and the purge runs.
    config
        .strategy_priorities
        .insert(FallbackStrategy::WhitespaceCompression, 0);
    let system = FallbackSystem::new(config);

    let mut items = vec![
        prose_item("crit-1", Priority::Critical),
        prose_item("crit-2", Priority::Critical),
    ];
    for i in 0..8 {
        items.push(prose_item(&format!("low-{i}"), Priority::Low));
    }
    let total: usize = items.iter().map(|i| i.token_count).sum();

    let out = system.handle(items.clone(), 0.05, "boom", false).await;
    assert_eq!(out.fallback_strategy, Some(FallbackStrategy::EmergencyPurge));
    assert!(out.emergency_measures_applied);
    let kept: Vec<&str> = out.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(kept, vec!["crit-1", "crit-2"]);
    for item in &out.items {
        assert!(item.content.ends_with(EMERGENCY_MARKER));
    }
    assert_eq!(out.removed_ids(&items).len(), 8);
    assert!(out.result.compressed_tokens <= total / 10 + 2 * 2);
}

#[tokio::test]
async fn purge_falls_back_to_recent_high_priority() {
    let config = FallbackConfig {
        max_fallback_attempts: 1,
        strategy_priorities: [(FallbackStrategy::WhitespaceCompression, 0)].into(),
        ..Default::default()
    };
    let system = FallbackSystem::new(config);
    let now = chrono::Utc::now();
    let items: Vec<ContextItem> = (0..5)
        .map(|i| {
            prose_item(&format!("h{i}"), Priority::High)
                .with_created_at(now - chrono::Duration::minutes(10 * (5 - i)))
        })
        .collect();

    let out = system.handle(items, 0.3, "boom", false).await;
    let kept: Vec<&str> = out.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(kept.len(), 3);
    for id in ["h4", "h3", "h2"] {
        assert!(kept.contains(&id), "{id} should survive");
    }
}

#[tokio::test]
async fn impossible_purge_echoes_originals() {
    let config = FallbackConfig {
        max_fallback_attempts: 1,
        strategy_priorities: [(FallbackStrategy::WhitespaceCompression, 0)].into(),
        ..Default::default()
    };
    let system = FallbackSystem::new(config);
    // Nothing critical or high-priority to keep.
    let items = vec![prose_item("m1", Priority::Medium), prose_item("m2", Priority::Low)];

    let out = system.handle(items.clone(), 0.5, "boom", false).await;
    assert!(!out.result.success);
    assert_eq!(out.fallback_strategy, None);
    assert_eq!(out.items, items);
    assert_eq!(out.result.compression_ratio, 1.0);
}

#[tokio::test]
async fn emergency_mode_can_remove_low_priority_items() {
    let config = FallbackConfig {
        strategy_priorities: [(FallbackStrategy::LowPriorityRemoval, 0)].into(),
        ..Default::default()
    };
    let system = FallbackSystem::new(config);
    let items = vec![
        prose_item("keep", Priority::High),
        prose_item("drop-1", Priority::Low),
        prose_item("drop-2", Priority::Cached),
    ];
    let out = system.handle(items, 0.4, "heap allocation failed", true).await;
    assert_eq!(out.fallback_strategy, Some(FallbackStrategy::LowPriorityRemoval));
    assert_eq!(out.items.len(), 1);
    assert!(out.emergency_measures_applied);
    assert_eq!(system.stats().successes, 1);
}
