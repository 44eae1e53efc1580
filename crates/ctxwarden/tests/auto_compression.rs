//! The auto-compression policy loop against real window managers.

use std::sync::Arc;
use std::time::Duration;

use ctxwarden::compression::EnhancedCompression;
use ctxwarden::prelude::*;

fn config(total: usize) -> WardenConfig {
    let mut config = WardenConfig::default()
        .with_total_tokens(total)
        .with_min_tokens_per_section(10);
    config.window.buffer_percentage = 0.0;
    config.window.dynamic_allocation = false;
    config.window.compression_threshold = 0.99;
    config
}

fn chatter(i: usize) -> String {
    (0..12)
        .map(|s| format!("In round {i} the reviewer flagged issue {s} in the parser and asked for a regression test."))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fill a window's conversation section to roughly `fill` of the window.
fn filled_window(cfg: &WardenConfig, fill: f64) -> SharedWindow {
    let mut manager = ContextWindowManager::new("main", cfg).unwrap();
    let target = (cfg.window.total_tokens as f64 * fill) as usize;
    let mut i = 0;
    while manager.get_current_window().used_tokens < target {
        let item = ContextItem::new(format!("turn-{i}"), chatter(i), ContentType::Conversation);
        if !manager.add_item(SectionName::Conversation, item) {
            break;
        }
        i += 1;
    }
    manager.into_shared()
}

/// Delegates to the content-aware compressor after a delay.
struct Slow(EnhancedCompressor);

impl TextCompressor for Slow {
    fn compress(
        &self,
        text: &str,
        ratio: f64,
    ) -> Result<EnhancedCompression, CompressionError> {
        std::thread::sleep(Duration::from_millis(50));
        self.0.compress(text, ratio)
    }
}

struct Panicking;

impl TextCompressor for Panicking {
    fn compress(
        &self,
        _text: &str,
        _ratio: f64,
    ) -> Result<EnhancedCompression, CompressionError> {
        panic!("compressor bug");
    }
}

#[tokio::test]
async fn warning_usage_compresses() {
    let mut cfg = config(4_000);
    cfg.window.allocation.conversation = 0.9;
    cfg.window.allocation.code = 0.0;
    cfg.window.allocation.system = 0.025;
    cfg.window.allocation.project = 0.025;
    cfg.window.allocation.memory = 0.05;
    let window = filled_window(&cfg, 0.88);

    let auto = AutoCompressionManager::new(&cfg).unwrap();
    auto.register("main", Arc::clone(&window));
    let snapshot = auto.usage_snapshot().await;
    assert_eq!(auto.urgency(&snapshot), Urgency::Warning);

    let report = auto.check_and_compress().await;
    assert!(report.success, "{report:?}");
    assert!(report.tokens_after < report.tokens_before);
    assert!(report.items_compressed > 0);
    assert!(window.lock().await.check_invariants());

    // Inside the minimum interval the next step only cools down.
    auto.invalidate_snapshot();
    let next = auto.check_and_compress().await;
    assert!(next.skipped.is_some());
}

#[tokio::test]
async fn concurrent_trigger_is_dropped() {
    let cfg = config(8_000);
    let window = filled_window(&cfg, 0.2);
    let auto = AutoCompressionManager::with_parts(
        &cfg,
        Arc::new(Slow(EnhancedCompressor::new())),
        Arc::new(EventBus::new()),
    )
    .unwrap();
    auto.register("main", window);

    let (first, second) = tokio::join!(
        auto.trigger_compression(Urgency::Warning),
        auto.trigger_compression(Urgency::Warning),
    );
    assert!(first.skipped.is_none());
    assert!(!second.success);
    assert_eq!(second.skipped.as_deref(), Some("compression already in progress"));
    assert_eq!(second.items_compressed + second.items_removed, 0);
    assert_eq!(auto.attempts(), 1);
    assert!(!auto.is_compressing());
}

#[tokio::test]
async fn pipeline_failure_runs_emergency_recovery() {
    let cfg = config(8_000);
    let window = filled_window(&cfg, 0.2);
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    let auto = AutoCompressionManager::with_parts(&cfg, Arc::new(Panicking), Arc::clone(&events)).unwrap();
    auto.register("main", Arc::clone(&window));

    let report = auto.trigger_compression(Urgency::Emergency).await;
    assert!(report.recovery);
    assert!(report.success, "{report:?}");
    assert!(report.tokens_after < report.tokens_before);
    assert!(window.lock().await.check_invariants());

    let mut saw_recovery = false;
    while let Ok(event) = rx.try_recv() {
        saw_recovery |= event.kind == EventKind::EmergencyRecovery;
    }
    assert!(saw_recovery);
}

#[tokio::test]
async fn critical_content_survives_emergency() {
    let cfg = config(4_000);
    let mut manager = ContextWindowManager::new("main", &cfg).unwrap();
    let rule = ContextItem::new(
        "rule",
        "Never force-push to the release branch.",
        ContentType::UserPreference,
    )
    .with_priority(Priority::Critical);
    manager.add(rule.clone());
    for i in 0..4 {
        manager.add(ContextItem::new(format!("t{i}"), chatter(i), ContentType::Conversation));
    }
    let window = manager.into_shared();
    let auto = AutoCompressionManager::new(&cfg).unwrap();
    auto.register("main", Arc::clone(&window));

    auto.trigger_compression(Urgency::Emergency).await;
    let guard = window.lock().await;
    assert_eq!(guard.item("rule").map(|i| i.content.as_str()), Some(rule.content.as_str()));
}

#[tokio::test]
async fn background_loop_compresses_on_its_own() {
    let mut cfg = config(4_000);
    cfg.window.allocation.conversation = 0.9;
    cfg.window.allocation.code = 0.0;
    cfg.window.allocation.system = 0.025;
    cfg.window.allocation.project = 0.025;
    cfg.window.allocation.memory = 0.05;
    cfg.auto_compression.monitoring_interval_ms = 1_000;
    let window = filled_window(&cfg, 0.9);

    let auto = AutoCompressionManager::new(&cfg).unwrap();
    let mut rx = auto.events().subscribe();
    auto.register("main", window);
    assert!(auto.start());

    let mut completed = false;
    for _ in 0..20 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(event)) if event.kind == EventKind::CompressionCompleted => {
                completed = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    auto.stop();
    assert!(completed);
    assert!(auto.attempts() >= 1);
}
