//! Token usage telemetry.
//!
//! [`TokenMonitor`] polls its registered window managers, keeps a bounded
//! history of [`DetailedSnapshot`]s, and publishes threshold, growth,
//! efficiency and opportunity events. It never mutates a window; acting on
//! the events is the auto-compression manager's job.
//!
//! Level events (`CompressionNeeded`, `CriticalUsage`, `EmergencyState`,
//! `LimitApproaching`) are edge-triggered: they fire when usage enters the
//! level and re-arm once it drops back below.

use crate::config::{MonitorConfig, WardenConfig};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, EventKind, WardenEvent};
use crate::snapshot::{ManagerView, TokenUsageSnapshot, build_snapshot, gather_views};
use crate::window::SharedWindow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Items touched within this window count as actively accessed.
const ACTIVE_ACCESS_HOURS: i64 = 1;

/// Allocation, relevance and access health of the registered windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EfficiencyMetrics {
    /// Used over allocated tokens.
    pub utilization: f64,
    pub wasted_tokens: usize,
    /// Share of original tokens removed from compressed items.
    pub compression_effectiveness: f64,
    pub average_relevance: f64,
    /// Share of items used within the last hour.
    pub access_efficiency: f64,
    /// `0.4 × utilization + 0.3 × relevance + 0.3 × access`.
    pub score: f64,
}

impl EfficiencyMetrics {
    pub fn from_views(views: &[ManagerView], now: DateTime<Utc>) -> Self {
        let mut allocated = 0usize;
        let mut used = 0usize;
        let mut wasted_tokens = 0usize;
        for view in views {
            for section in view.window.sections.values() {
                allocated += section.max_tokens;
                used += section.tokens;
                wasted_tokens += section.max_tokens.saturating_sub(section.tokens);
            }
        }

        let items: Vec<_> = views.iter().flat_map(|v| v.window.items().map(|(_, i)| i)).collect();
        let (mut original, mut current) = (0usize, 0usize);
        for item in &items {
            if let Some(before) = item.original_tokens() {
                original += before;
                current += item.token_count;
            }
        }
        let compression_effectiveness = if original == 0 {
            0.0
        } else {
            1.0 - current as f64 / original as f64
        };

        let (average_relevance, access_efficiency) = if items.is_empty() {
            (0.0, 0.0)
        } else {
            let n = items.len() as f64;
            let cutoff = now - ChronoDuration::hours(ACTIVE_ACCESS_HOURS);
            let relevance = items.iter().map(|i| i.relevance_score).sum::<f64>() / n;
            let active = items.iter().filter(|i| i.last_activity() >= cutoff).count() as f64;
            (relevance, active / n)
        };

        let utilization = if allocated == 0 {
            0.0
        } else {
            used as f64 / allocated as f64
        };
        Self {
            utilization,
            wasted_tokens,
            compression_effectiveness,
            average_relevance,
            access_efficiency,
            score: 0.4 * utilization + 0.3 * average_relevance + 0.3 * access_efficiency,
        }
    }
}

/// A usage snapshot with breakdowns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedSnapshot {
    pub usage: TokenUsageSnapshot,
    pub by_manager: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub efficiency: EfficiencyMetrics,
}

impl DetailedSnapshot {
    fn build(views: &[ManagerView], usage: TokenUsageSnapshot, now: DateTime<Utc>) -> Self {
        let mut by_manager = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_priority: BTreeMap<String, usize> = BTreeMap::new();
        for view in views {
            by_manager.insert(view.id.clone(), view.window.used_tokens);
            for (_, item) in view.window.items() {
                *by_type.entry(item.content_type.label().to_string()).or_default() += item.token_count;
                *by_priority.entry(item.priority.label().to_string()).or_default() += item.token_count;
            }
        }
        Self {
            efficiency: EfficiencyMetrics::from_views(views, now),
            usage,
            by_manager,
            by_type,
            by_priority,
        }
    }
}

#[derive(Debug, Default)]
struct Levels {
    growth_spike: bool,
    compression_needed: bool,
    critical: bool,
    emergency: bool,
    limit_approaching: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    snapshots: VecDeque<DetailedSnapshot>,
    usage_history: VecDeque<TokenUsageSnapshot>,
    events: VecDeque<WardenEvent>,
    last_ratio: f64,
    last_efficiency: Option<f64>,
    levels: Levels,
    reported_opportunities: HashSet<String>,
}

struct MonitorInner {
    config: MonitorConfig,
    warden: WardenConfig,
    managers: Mutex<BTreeMap<String, SharedWindow>>,
    events: Arc<EventBus>,
    state: Mutex<MonitorState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Polls window managers and publishes usage events. Cheap to clone.
#[derive(Clone)]
pub struct TokenMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for TokenMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMonitor")
            .field("managers", &self.lock_managers().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl TokenMonitor {
    pub fn new(config: &WardenConfig) -> Result<Self> {
        Self::with_events(config, Arc::new(EventBus::new()))
    }

    /// Publish onto an existing bus, e.g. one shared with the
    /// auto-compression manager.
    pub fn with_events(config: &WardenConfig, events: Arc<EventBus>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config: config.monitor.clone(),
                warden: config.clone(),
                managers: Mutex::new(BTreeMap::new()),
                events,
                state: Mutex::new(MonitorState::default()),
                shutdown: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn register(&self, id: impl Into<String>, manager: SharedWindow) {
        self.lock_managers().insert(id.into(), manager);
    }

    pub fn unregister(&self, id: &str) -> Result<()> {
        self.lock_managers()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| WardenError::UnknownManager(id.to_string()))
    }

    fn lock_managers(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SharedWindow>> {
        self.inner.managers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Polling ────────────────────────────────────────────────────

    /// The polling period: the high-frequency interval once utilization
    /// is at or above the high-frequency threshold.
    pub fn current_interval(&self) -> Duration {
        if self.lock_state().last_ratio >= self.inner.config.high_frequency_threshold {
            self.inner.config.high_frequency_interval()
        } else {
            self.inner.config.interval()
        }
    }

    /// Take one snapshot, record it, and publish whatever it triggers.
    pub async fn poll(&self) -> DetailedSnapshot {
        let managers: Vec<(String, SharedWindow)> = self
            .lock_managers()
            .iter()
            .map(|(id, m)| (id.clone(), Arc::clone(m)))
            .collect();
        let views = gather_views(&managers).await;
        let now = Utc::now();

        let (detailed, events) = {
            let mut state = self.lock_state();
            let usage = build_snapshot(
                &views,
                self.inner.config.max_token_limit,
                &state.usage_history,
                &self.inner.warden.compression,
                self.inner.warden.compression.target_ratio,
                now,
            );
            let detailed = DetailedSnapshot::build(&views, usage, now);
            let events = self.evaluate(&mut state, &detailed);
            state.usage_history.push_back(detailed.usage.clone());
            state.snapshots.push_back(detailed.clone());
            state.events.extend(events.iter().cloned());
            self.prune(&mut state, now);
            (detailed, events)
        };

        for event in events {
            self.inner.events.emit(event);
        }
        detailed
    }

    fn evaluate(&self, state: &mut MonitorState, snap: &DetailedSnapshot) -> Vec<WardenEvent> {
        let c = &self.inner.config;
        let usage = &snap.usage;
        let ratio = usage.utilization_ratio;
        let mut out = Vec::new();
        let event = |kind: EventKind, details: serde_json::Value| {
            WardenEvent::new(kind, usage.clone()).with_details(details)
        };

        for &threshold in &c.alert_thresholds {
            if state.last_ratio < threshold && ratio >= threshold {
                out.push(event(
                    EventKind::ThresholdCrossed,
                    serde_json::json!({ "threshold": threshold, "previous": state.last_ratio }),
                ));
            }
        }

        if let Some(previous) = state.last_efficiency
            && previous - snap.efficiency.score > c.efficiency_drop
        {
            out.push(event(
                EventKind::EfficiencyDrop,
                serde_json::json!({ "previous": previous, "current": snap.efficiency.score }),
            ));
        }

        let minutes = usage.minutes_until_limit();
        let approaching = minutes.is_some_and(|m| m <= c.prediction_horizon_minutes);
        let levels = [
            (
                usage.projected_growth >= c.growth_spike_tokens_per_minute,
                &mut state.levels.growth_spike,
                EventKind::GrowthSpike,
            ),
            (
                ratio >= c.compression_threshold,
                &mut state.levels.compression_needed,
                EventKind::CompressionNeeded,
            ),
            (ratio >= c.critical_threshold, &mut state.levels.critical, EventKind::CriticalUsage),
            (ratio >= c.emergency_threshold, &mut state.levels.emergency, EventKind::EmergencyState),
            (approaching, &mut state.levels.limit_approaching, EventKind::LimitApproaching),
        ];
        for (active, armed, kind) in levels {
            if active && !*armed {
                out.push(event(
                    kind,
                    serde_json::json!({
                        "utilization": ratio,
                        "minutesUntilLimit": minutes,
                        "tokensPerMinute": usage.projected_growth,
                    }),
                ));
            }
            *armed = active;
        }

        let mut current = HashSet::new();
        for opportunity in &usage.opportunities {
            if opportunity.estimated_savings < c.min_opportunity_tokens {
                continue;
            }
            let key = format!("{}/{}", opportunity.manager_id, opportunity.section);
            if !state.reported_opportunities.contains(&key) {
                out.push(event(
                    EventKind::OptimizationOpportunity,
                    serde_json::to_value(opportunity).unwrap_or_default(),
                ));
            }
            current.insert(key);
        }
        state.reported_opportunities = current;

        state.last_ratio = ratio;
        state.last_efficiency = Some(snap.efficiency.score);
        for e in &out {
            tracing::debug!("[monitor] {} at {:.1}%", e.kind, ratio * 100.0);
        }
        out
    }

    /// Drop history past its age or count limit.
    fn prune(&self, state: &mut MonitorState, now: DateTime<Utc>) {
        let c = &self.inner.config;
        let snapshot_cutoff = now - ChronoDuration::milliseconds(c.snapshot_retention_ms as i64);
        let event_cutoff = now - ChronoDuration::milliseconds(c.event_retention_ms as i64);

        while state
            .snapshots
            .front()
            .is_some_and(|s| s.usage.at < snapshot_cutoff || state.snapshots.len() > c.max_snapshots)
        {
            state.snapshots.pop_front();
        }
        while state
            .usage_history
            .front()
            .is_some_and(|s| s.at < snapshot_cutoff || state.usage_history.len() > c.max_snapshots)
        {
            state.usage_history.pop_front();
        }
        while state
            .events
            .front()
            .is_some_and(|e| e.at < event_cutoff || state.events.len() > c.max_events)
        {
            state.events.pop_front();
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn history(&self) -> Vec<DetailedSnapshot> {
        self.lock_state().snapshots.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<DetailedSnapshot> {
        self.lock_state().snapshots.back().cloned()
    }

    /// The last `n` recorded events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<WardenEvent> {
        let state = self.lock_state();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    /// A human-readable summary of the latest snapshot.
    pub fn report(&self) -> String {
        let state = self.lock_state();
        let Some(snap) = state.snapshots.back() else {
            return "No usage recorded yet.\n".to_string();
        };
        let u = &snap.usage;
        let e = &snap.efficiency;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Token usage: {} / {} ({:.1}%)",
            u.total_tokens,
            u.max_limit,
            u.utilization_ratio * 100.0
        );
        match u.minutes_until_limit() {
            Some(m) => {
                let _ = writeln!(
                    out,
                    "Growth: {:+.1} tokens/min (limit in {m:.1} min)",
                    u.projected_growth
                );
            }
            None => {
                let _ = writeln!(out, "Growth: {:+.1} tokens/min", u.projected_growth);
            }
        }
        let _ = writeln!(
            out,
            "Efficiency: {:.2} (wasted {} tokens, compression {:.1}%, relevance {:.2}, active {:.0}%)",
            e.score,
            e.wasted_tokens,
            e.compression_effectiveness * 100.0,
            e.average_relevance,
            e.access_efficiency * 100.0
        );
        if !snap.by_manager.is_empty() {
            let _ = writeln!(out, "Managers:");
            for (id, tokens) in &snap.by_manager {
                let _ = writeln!(out, "  {id}: {tokens}");
            }
        }
        if !snap.by_type.is_empty() {
            let _ = writeln!(out, "By type:");
            for (kind, tokens) in &snap.by_type {
                let _ = writeln!(out, "  {kind}: {tokens}");
            }
        }
        if !u.opportunities.is_empty() {
            let _ = writeln!(out, "Opportunities:");
            for o in &u.opportunities {
                let _ = writeln!(
                    out,
                    "  {}/{}: ~{} tokens via {}",
                    o.manager_id, o.section, o.estimated_savings, o.recommended_strategy
                );
            }
        }
        let _ = writeln!(out, "Recorded events: {}", state.events.len());
        out
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Start polling. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let mut slot = self.inner.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        let (tx, mut rx) = watch::channel(false);
        *slot = Some(tx);
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = this.current_interval();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        this.poll().await;
                    }
                    _ = rx.changed() => break,
                }
            }
            tracing::debug!("[monitor] stopped");
        });
        tracing::info!("[monitor] started");
        true
    }

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
