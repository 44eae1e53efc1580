//! The auto-compression policy loop.
//!
//! [`AutoCompressionManager`] watches the aggregate usage of every
//! registered window manager and compresses when utilization crosses the
//! warning or emergency threshold, or earlier when growth projects the
//! limit within the prediction horizon.
//!
//! Compression runs the robust pipeline: each section is prioritized,
//! expendable items are removed, and every item marked for compression is
//! compressed on a blocking thread by a [`TextCompressor`]. Items that
//! fail or miss the target go to the [`FallbackSystem`]. If the pipeline
//! itself breaks, one emergency fallback pass runs over every item of
//! every manager.
//!
//! At most one pass runs at a time; a trigger while one is in flight is
//! dropped, not queued.

use crate::compression::{EnhancedCompressor, TextCompressor, meets_target};
use crate::config::{AutoCompressionConfig, CompressionConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, EventKind, Severity, WardenEvent};
use crate::fallback::{FallbackResult, FallbackSystem};
use crate::item::{ContextItem, SectionName};
use crate::snapshot::{TokenUsageSnapshot, build_snapshot, gather_views};
use crate::window::{ContextWindowManager, SharedWindow};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

/// Ratio multiplier in emergency.
const EMERGENCY_FACTOR: f64 = 0.5;
/// Ratio multiplier below emergency.
const WARNING_FACTOR: f64 = 0.7;
/// Ratio multiplier for total-failure recovery.
const RECOVERY_FACTOR: f64 = 0.3;

/// How pressing the current usage is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Normal,
    Predictive,
    Warning,
    Emergency,
}

/// What one compression pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionReport {
    pub urgency: Urgency,
    pub success: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub items_compressed: usize,
    pub items_removed: usize,
    pub fallbacks_used: usize,
    /// Whether total-failure recovery ran.
    pub recovery: bool,
    /// Why the pass did not run, if it did not.
    pub skipped: Option<String>,
    pub duration_ms: u64,
}

impl CompressionReport {
    fn skip(urgency: Urgency, tokens: usize, reason: &str) -> Self {
        Self {
            urgency,
            success: false,
            tokens_before: tokens,
            tokens_after: tokens,
            items_compressed: 0,
            items_removed: 0,
            fallbacks_used: 0,
            recovery: false,
            skipped: Some(reason.to_string()),
            duration_ms: 0,
        }
    }

    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }
}

#[derive(Debug, Default)]
struct PassTotals {
    compressed: usize,
    removed: usize,
    fallbacks: usize,
}

#[derive(Debug, Default)]
struct AutoState {
    history: VecDeque<TokenUsageSnapshot>,
    cached: Option<(Instant, TokenUsageSnapshot)>,
    last_attempt: Option<Instant>,
    attempts: u32,
}

struct Inner {
    config: AutoCompressionConfig,
    compression: CompressionConfig,
    managers: Mutex<BTreeMap<String, SharedWindow>>,
    compressor: Arc<dyn TextCompressor>,
    fallback: FallbackSystem,
    events: Arc<EventBus>,
    compressing: AtomicBool,
    state: Mutex<AutoState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Policy loop over a registry of window managers. Cheap to clone.
#[derive(Clone)]
pub struct AutoCompressionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AutoCompressionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoCompressionManager")
            .field("managers", &self.manager_ids())
            .field("compressing", &self.is_compressing())
            .finish()
    }
}

impl AutoCompressionManager {
    /// A manager with the content-aware compressor and a fresh event bus.
    pub fn new(config: &WardenConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(EnhancedCompressor::new()),
            Arc::new(EventBus::new()),
        )
    }

    pub fn with_parts(
        config: &WardenConfig,
        compressor: Arc<dyn TextCompressor>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config: config.auto_compression.clone(),
                compression: config.compression.clone(),
                managers: Mutex::new(BTreeMap::new()),
                compressor,
                fallback: FallbackSystem::new(config.fallback.clone()),
                events,
                compressing: AtomicBool::new(false),
                state: Mutex::new(AutoState::default()),
                shutdown: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &AutoCompressionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn fallback(&self) -> &FallbackSystem {
        &self.inner.fallback
    }

    // ── Registry ───────────────────────────────────────────────────

    /// Register a window manager. Replaces any manager with the same id.
    pub fn register(&self, id: impl Into<String>, manager: SharedWindow) {
        let id = id.into();
        tracing::debug!("[auto] registered manager {id}");
        self.lock_managers().insert(id, manager);
        self.invalidate_snapshot();
    }

    pub fn unregister(&self, id: &str) -> Result<SharedWindow> {
        let removed = self
            .lock_managers()
            .remove(id)
            .ok_or_else(|| WardenError::UnknownManager(id.to_string()))?;
        self.invalidate_snapshot();
        Ok(removed)
    }

    pub fn manager(&self, id: &str) -> Option<SharedWindow> {
        self.lock_managers().get(id).cloned()
    }

    pub fn manager_ids(&self) -> Vec<String> {
        self.lock_managers().keys().cloned().collect()
    }

    fn managers(&self) -> Vec<(String, SharedWindow)> {
        self.lock_managers()
            .iter()
            .map(|(id, m)| (id.clone(), Arc::clone(m)))
            .collect()
    }

    fn lock_managers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SharedWindow>> {
        self.inner.managers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AutoState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Usage ──────────────────────────────────────────────────────

    /// Aggregate usage, served from cache when younger than the snapshot
    /// cache window. Fresh snapshots are appended to the history.
    pub async fn usage_snapshot(&self) -> TokenUsageSnapshot {
        {
            let state = self.lock_state();
            if let Some((at, snap)) = &state.cached
                && at.elapsed() < self.inner.config.snapshot_cache()
            {
                return snap.clone();
            }
        }
        let views = gather_views(&self.managers()).await;
        let mut state = self.lock_state();
        let snapshot = build_snapshot(
            &views,
            self.inner.config.max_token_limit,
            &state.history,
            &self.inner.compression,
            self.inner.config.target_compression_ratio,
            Utc::now(),
        );
        state.history.push_back(snapshot.clone());
        while state.history.len() > self.inner.config.history_size {
            state.history.pop_front();
        }
        state.cached = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    pub fn invalidate_snapshot(&self) {
        self.lock_state().cached = None;
    }

    pub fn history(&self) -> Vec<TokenUsageSnapshot> {
        self.lock_state().history.iter().cloned().collect()
    }

    pub fn attempts(&self) -> u32 {
        self.lock_state().attempts
    }

    pub fn is_compressing(&self) -> bool {
        self.inner.compressing.load(Ordering::Acquire)
    }

    /// Classify a snapshot.
    ///
    /// Predictive applies only at or above the predictive threshold and
    /// when the limit is projected within the horizon.
    pub fn urgency(&self, snapshot: &TokenUsageSnapshot) -> Urgency {
        let c = &self.inner.config;
        let ratio = snapshot.utilization_ratio;
        if ratio >= c.emergency_threshold {
            Urgency::Emergency
        } else if ratio >= c.compression_threshold {
            Urgency::Warning
        } else if ratio >= c.predictive_threshold
            && snapshot
                .minutes_until_limit()
                .is_some_and(|m| m <= c.prediction_horizon_minutes)
        {
            Urgency::Predictive
        } else {
            Urgency::Normal
        }
    }

    /// Ratio a pass at `urgency` compresses to.
    pub fn ratio_for(&self, urgency: Urgency) -> f64 {
        let factor = if urgency == Urgency::Emergency {
            EMERGENCY_FACTOR
        } else {
            WARNING_FACTOR
        };
        self.inner.config.target_compression_ratio * factor
    }

    // ── Policy ─────────────────────────────────────────────────────

    /// One policy step: classify usage and compress if warranted.
    pub async fn check_and_compress(&self) -> CompressionReport {
        let snapshot = self.usage_snapshot().await;
        let urgency = self.urgency(&snapshot);
        if urgency == Urgency::Normal {
            return CompressionReport::skip(urgency, snapshot.total_tokens, "below threshold");
        }

        let severity = match urgency {
            Urgency::Emergency => Severity::Emergency,
            _ => Severity::Warning,
        };
        self.inner.events.emit(
            WardenEvent::new(EventKind::CompressionWarning, snapshot.clone())
                .with_severity(severity)
                .with_details(serde_json::json!({
                    "urgency": urgency,
                    "minutesUntilLimit": snapshot.minutes_until_limit(),
                })),
        );

        let cooling = self
            .lock_state()
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.inner.config.min_compression_interval());
        if cooling {
            tracing::debug!("[auto] {urgency:?} usage but cooling down");
            return CompressionReport::skip(urgency, snapshot.total_tokens, "cooling down");
        }
        self.trigger_compression(urgency).await
    }

    /// Run one compression pass now.
    ///
    /// Returns immediately with `success: false` if a pass is already in
    /// flight or the attempt budget is spent.
    pub async fn trigger_compression(&self, urgency: Urgency) -> CompressionReport {
        if self
            .inner
            .compressing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("[auto] compression already in progress, trigger dropped");
            return CompressionReport::skip(urgency, 0, "compression already in progress");
        }
        let _guard = InFlight(&self.inner.compressing);

        {
            let mut state = self.lock_state();
            if state.attempts >= self.inner.config.max_compression_attempts {
                tracing::warn!(
                    "[auto] attempt budget of {} exhausted",
                    self.inner.config.max_compression_attempts
                );
                return CompressionReport::skip(urgency, 0, "attempt budget exhausted");
            }
            state.attempts += 1;
            state.last_attempt = Some(Instant::now());
        }

        let started = Instant::now();
        self.invalidate_snapshot();
        let before = self.usage_snapshot().await;
        let ratio = self.ratio_for(urgency);
        let emergency = urgency == Urgency::Emergency;
        tracing::info!(
            "[auto] {urgency:?} compression at ratio {ratio:.2} ({} / {} tokens)",
            before.total_tokens,
            before.max_limit
        );
        self.inner.events.emit(
            WardenEvent::new(EventKind::CompressionStarted, before.clone())
                .with_details(serde_json::json!({ "urgency": urgency, "targetRatio": ratio })),
        );

        let (totals, recovery, recovered) = match self.robust_pipeline(ratio, emergency, &before).await {
            Ok(totals) => (totals, false, true),
            Err(e) => {
                tracing::error!("[auto] pipeline failed: {e}; running emergency recovery");
                let (totals, ok) = self.total_failure_recovery(&e.to_string(), &before).await;
                (totals, true, ok)
            }
        };

        self.invalidate_snapshot();
        let after = self.usage_snapshot().await;
        let success = recovered && after.total_tokens < before.total_tokens;
        let report = CompressionReport {
            urgency,
            success,
            tokens_before: before.total_tokens,
            tokens_after: after.total_tokens,
            items_compressed: totals.compressed,
            items_removed: totals.removed,
            fallbacks_used: totals.fallbacks,
            recovery,
            skipped: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let kind = if success {
            EventKind::CompressionCompleted
        } else {
            EventKind::CompressionFailed
        };
        let details = serde_json::to_value(&report).unwrap_or_default();
        self.inner
            .events
            .emit(WardenEvent::new(kind, after).with_details(details));
        tracing::info!(
            "[auto] pass done: {} -> {} tokens, {} compressed, {} removed, {} fallbacks",
            report.tokens_before,
            report.tokens_after,
            report.items_compressed,
            report.items_removed,
            report.fallbacks_used
        );
        report
    }

    // ── Pipelines ──────────────────────────────────────────────────

    async fn robust_pipeline(
        &self,
        ratio: f64,
        emergency: bool,
        snapshot: &TokenUsageSnapshot,
    ) -> Result<PassTotals> {
        let mut totals = PassTotals::default();
        for (id, manager) in self.managers() {
            let mut window = manager.lock().await;
            for section in SectionName::ALL {
                let (removed, plan) = window.evict_section(section);
                totals.removed += removed.len();
                for item_id in &plan.to_compress {
                    let Some(item) = window.item(item_id).filter(|i| !i.is_compressed()).cloned() else {
                        continue;
                    };
                    self.compress_one(&id, &mut window, item, ratio, emergency, snapshot, &mut totals)
                        .await?;
                }
            }
            window.recompute_totals();
        }
        Ok(totals)
    }

    #[allow(clippy::too_many_arguments)]
    async fn compress_one(
        &self,
        manager_id: &str,
        window: &mut ContextWindowManager,
        item: ContextItem,
        ratio: f64,
        emergency: bool,
        snapshot: &TokenUsageSnapshot,
        totals: &mut PassTotals,
    ) -> Result<()> {
        let compressor = Arc::clone(&self.inner.compressor);
        let content = item.content.clone();
        let outcome = tokio::task::spawn_blocking(move || compressor.compress(&content, ratio))
            .await
            .map_err(|e| WardenError::Pipeline(format!("compression task for {} failed: {e}", item.id)))?;

        let tolerance = self.inner.fallback.config().success_tolerance;
        let error = match outcome {
            Ok(done) if meets_target(done.result.compressed_tokens, item.token_count, ratio, tolerance) => {
                if window.replace_item_content(&item.id, done.result.compressed, &done.result.strategy) {
                    totals.compressed += 1;
                }
                return Ok(());
            }
            Ok(done) => format!(
                "insufficient compression: achieved ratio {:.2}, target {ratio:.2}",
                done.result.compression_ratio
            ),
            Err(e) => e.to_string(),
        };

        tracing::debug!("[auto] {manager_id}/{}: {error}", item.id);
        let before = vec![item];
        let result = self
            .inner
            .fallback
            .handle(before.clone(), ratio, &error, emergency)
            .await;
        totals.fallbacks += 1;
        let (removed, replaced) = apply_fallback(window, &before, &result);
        totals.removed += removed;
        totals.compressed += replaced;
        self.inner.events.emit(
            WardenEvent::new(EventKind::FallbackApplied, snapshot.clone()).with_details(serde_json::json!({
                "managerId": manager_id,
                "itemId": before[0].id,
                "error": error,
                "errorClass": result.error_class,
                "strategy": result.fallback_strategy,
                "success": result.result.success,
            })),
        );
        Ok(())
    }

    /// Last line of defense: one emergency fallback over every item.
    async fn total_failure_recovery(
        &self,
        error: &str,
        snapshot: &TokenUsageSnapshot,
    ) -> (PassTotals, bool) {
        let ratio = self.inner.config.target_compression_ratio * RECOVERY_FACTOR;
        let managers = self.managers();
        let mut all = Vec::new();
        for (_, manager) in &managers {
            let window = manager.lock().await;
            all.extend(window.get_current_window().items().map(|(_, i)| i.clone()));
        }
        let result = self.inner.fallback.handle(all.clone(), ratio, error, true).await;

        let mut totals = PassTotals {
            fallbacks: 1,
            ..Default::default()
        };
        for (_, manager) in &managers {
            let mut window = manager.lock().await;
            let (removed, replaced) = apply_fallback(&mut window, &all, &result);
            totals.removed += removed;
            totals.compressed += replaced;
        }
        self.inner.events.emit(
            WardenEvent::new(EventKind::EmergencyRecovery, snapshot.clone()).with_details(serde_json::json!({
                "error": error,
                "success": result.result.success,
                "strategy": result.fallback_strategy,
                "actions": result.recovery_actions,
            })),
        );
        (totals, result.result.success)
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Start the periodic policy loop. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut slot = self.inner.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        let (tx, mut rx) = watch::channel(false);
        *slot = Some(tx);
        let this = self.clone();
        let period = self.inner.config.monitoring_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = this.check_and_compress().await;
                        if let Some(reason) = &report.skipped {
                            tracing::trace!("[auto] tick skipped: {reason}");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
            tracing::debug!("[auto] loop stopped");
        });
        tracing::info!("[auto] loop started, every {period:?}");
        true
    }

    /// Stop the loop. An in-flight pass runs to completion.
    pub fn stop(&self) {
        if let Some(tx) = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Write a fallback outcome back into a window: drop what the fallback
/// removed and replace what it rewrote. Returns (removed, replaced).
fn apply_fallback(
    window: &mut ContextWindowManager,
    before: &[ContextItem],
    result: &FallbackResult,
) -> (usize, usize) {
    if !result.result.success {
        return (0, 0);
    }
    let removed_ids: Vec<String> = result
        .removed_ids(before)
        .into_iter()
        .filter(|id| window.contains(id))
        .collect();
    let removed = window.remove_items(&removed_ids);
    let mut replaced = 0;
    for (item, original) in result.items.iter().filter_map(|i| {
        before.iter().find(|b| b.id == i.id).map(|b| (i, b))
    }) {
        if item.content != original.content
            && window.replace_item_content(&item.id, item.content.clone(), "fallback")
        {
            replaced += 1;
        }
    }
    (removed, replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompressionError;
    use crate::item::ContentType;

    fn config(total: usize) -> WardenConfig {
        let mut config = WardenConfig::default()
            .with_total_tokens(total)
            .with_min_tokens_per_section(10);
        config.window.buffer_percentage = 0.0;
        config.window.dynamic_allocation = false;
        config
    }

    fn snapshot(used: usize, limit: usize, growth: f64) -> TokenUsageSnapshot {
        TokenUsageSnapshot {
            total_tokens: used,
            utilization_ratio: used as f64 / limit as f64,
            projected_growth: growth,
            ..TokenUsageSnapshot::empty(limit)
        }
    }

    #[test]
    fn urgency_levels() {
        let auto = AutoCompressionManager::new(&config(1_000)).unwrap();
        assert_eq!(auto.urgency(&snapshot(500, 1_000, 0.0)), Urgency::Normal);
        assert_eq!(auto.urgency(&snapshot(860, 1_000, 0.0)), Urgency::Warning);
        assert_eq!(auto.urgency(&snapshot(960, 1_000, 0.0)), Urgency::Emergency);
        // 250 headroom at 10/min is 25 minutes.
        assert_eq!(auto.urgency(&snapshot(750, 1_000, 10.0)), Urgency::Predictive);
        // Growing fast but below the predictive floor.
        assert_eq!(auto.urgency(&snapshot(600, 1_000, 100.0)), Urgency::Normal);
        // Above the floor but the limit is far off.
        assert_eq!(auto.urgency(&snapshot(750, 1_000, 1.0)), Urgency::Normal);
    }

    #[test]
    fn ratios_by_urgency() {
        let auto = AutoCompressionManager::new(&config(1_000)).unwrap();
        assert!((auto.ratio_for(Urgency::Warning) - 0.42).abs() < 1e-9);
        assert!((auto.ratio_for(Urgency::Emergency) - 0.30).abs() < 1e-9);
    }

    #[test]
    fn unknown_manager_is_an_error() {
        let auto = AutoCompressionManager::new(&config(1_000)).unwrap();
        assert!(matches!(
            auto.unregister("nope"),
            Err(WardenError::UnknownManager(_))
        ));
    }

    #[tokio::test]
    async fn normal_usage_skips() {
        let auto = AutoCompressionManager::new(&config(10_000)).unwrap();
        let manager = ContextWindowManager::new("m", &config(10_000)).unwrap();
        auto.register("m", manager.into_shared());
        let report = auto.check_and_compress().await;
        assert_eq!(report.skipped.as_deref(), Some("below threshold"));
        assert_eq!(auto.attempts(), 0);
    }

    struct Failing;
    impl TextCompressor for Failing {
        fn compress(
            &self,
            _text: &str,
            _ratio: f64,
        ) -> std::result::Result<crate::compression::EnhancedCompression, CompressionError> {
            Err(CompressionError::Timeout(10))
        }
    }

    #[tokio::test]
    async fn failures_route_to_fallback() {
        let cfg = config(4_000);
        let auto =
            AutoCompressionManager::with_parts(&cfg, Arc::new(Failing), Arc::new(EventBus::new()))
                .unwrap();
        let mut rx = auto.events().subscribe();
        let mut manager = ContextWindowManager::new("m", &cfg).unwrap();
        let text = (0..40)
            .map(|i| format!("Step {i} uploads the bundle to the staging bucket and waits."))
            .collect::<Vec<_>>()
            .join(" ");
        manager.add(ContextItem::new("c", text, ContentType::Conversation));
        auto.register("m", manager.into_shared());

        let report = auto.trigger_compression(Urgency::Warning).await;
        assert!(report.success, "{report:?}");
        assert_eq!(report.fallbacks_used, 1);
        assert!(report.tokens_after < report.tokens_before);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::FallbackApplied));
        assert_eq!(kinds.last(), Some(&EventKind::CompressionCompleted));
    }

    #[tokio::test]
    async fn attempt_budget_is_enforced() {
        let mut cfg = config(1_000);
        cfg.auto_compression.max_compression_attempts = 1;
        let auto = AutoCompressionManager::new(&cfg).unwrap();
        auto.trigger_compression(Urgency::Warning).await;
        let second = auto.trigger_compression(Urgency::Warning).await;
        assert_eq!(second.skipped.as_deref(), Some("attempt budget exhausted"));
        assert!(!second.success);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop() {
        let auto = AutoCompressionManager::new(&config(1_000)).unwrap();
        assert!(auto.start());
        assert!(!auto.start());
        tokio::time::sleep(std::time::Duration::from_secs(65)).await;
        auto.stop();
        assert!(!auto.is_running());
    }
}
