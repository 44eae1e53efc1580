//! Event taxonomy and the publish/subscribe surface.
//!
//! The auto-compression manager and the token monitor publish
//! [`WardenEvent`]s through an [`EventBus`]. Consumers either register an
//! [`EventHandler`] (called synchronously, in registration order) or call
//! [`EventBus::subscribe`] for a `tokio::sync::broadcast` receiver.

use crate::snapshot::TokenUsageSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Severity tag attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// The closed set of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    // Token monitor.
    ThresholdCrossed,
    GrowthSpike,
    EfficiencyDrop,
    CompressionNeeded,
    LimitApproaching,
    CriticalUsage,
    EmergencyState,
    OptimizationOpportunity,
    // Auto-compression manager.
    CompressionWarning,
    CompressionStarted,
    CompressionCompleted,
    CompressionFailed,
    FallbackApplied,
    EmergencyRecovery,
}

impl EventKind {
    pub fn default_severity(self) -> Severity {
        match self {
            Self::OptimizationOpportunity
            | Self::CompressionStarted
            | Self::CompressionCompleted
            | Self::ThresholdCrossed => Severity::Info,
            Self::GrowthSpike
            | Self::EfficiencyDrop
            | Self::CompressionNeeded
            | Self::LimitApproaching
            | Self::CompressionWarning
            | Self::FallbackApplied => Severity::Warning,
            Self::CriticalUsage | Self::CompressionFailed => Severity::Critical,
            Self::EmergencyState | Self::EmergencyRecovery => Severity::Emergency,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ThresholdCrossed => "threshold-crossed",
            Self::GrowthSpike => "growth-spike",
            Self::EfficiencyDrop => "efficiency-drop",
            Self::CompressionNeeded => "compression-needed",
            Self::LimitApproaching => "limit-approaching",
            Self::CriticalUsage => "critical-usage",
            Self::EmergencyState => "emergency-state",
            Self::OptimizationOpportunity => "optimization-opportunity",
            Self::CompressionWarning => "compression-warning",
            Self::CompressionStarted => "compression-started",
            Self::CompressionCompleted => "compression-completed",
            Self::CompressionFailed => "compression-failed",
            Self::FallbackApplied => "fallback-applied",
            Self::EmergencyRecovery => "emergency-recovery",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One published event: kind, severity, the triggering snapshot, and
/// event-specific fields in `details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WardenEvent {
    pub kind: EventKind,
    pub severity: Severity,
    pub snapshot: TokenUsageSnapshot,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl WardenEvent {
    /// Create an event with the kind's default severity and no details.
    pub fn new(kind: EventKind, snapshot: TokenUsageSnapshot) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            snapshot,
            details: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Receives events as they are published.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &WardenEvent) {
        let _ = event;
    }
}

/// Ignores everything.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Logs every event through `tracing` at a level matching its severity.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &WardenEvent) {
        let pct = event.snapshot.utilization_ratio * 100.0;
        match event.severity {
            Severity::Info => tracing::info!(
                "[event] {} ({pct:.1}% of {} tokens)",
                event.kind,
                event.snapshot.max_limit
            ),
            Severity::Warning => tracing::warn!(
                "[event] {} ({pct:.1}% of {} tokens)",
                event.kind,
                event.snapshot.max_limit
            ),
            Severity::Critical | Severity::Emergency => tracing::error!(
                "[event] {} [{}] ({pct:.1}% of {} tokens) {}",
                event.kind,
                event.severity,
                event.snapshot.max_limit,
                event.details
            ),
        }
    }
}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if event.severity >= Severity::Critical {
///         page_someone(event);
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&WardenEvent) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&WardenEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&WardenEvent) + Send + Sync,
{
    fn on_event(&self, event: &WardenEvent) {
        (self.0)(event)
    }
}

/// Dispatches to several handlers in registration order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler without breaking the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &WardenEvent) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

// ── Bus ────────────────────────────────────────────────────────────

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out point for published events.
///
/// Handlers run inline on the publishing task; broadcast subscribers that
/// fall behind lose the oldest events (`RecvError::Lagged`).
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    sender: broadcast::Sender<WardenEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a handler. Handlers are never removed.
    pub fn add_handler(&self, handler: impl EventHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.sender.subscribe()
    }

    /// Publish to handlers, then to broadcast subscribers.
    pub fn emit(&self, event: WardenEvent) {
        // Snapshot the list so a handler may register another handler.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in &handlers {
            handler.on_event(&event);
        }
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_count())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn snapshot() -> TokenUsageSnapshot {
        TokenUsageSnapshot::empty(1_000)
    }

    #[test]
    fn severities_are_fixed_per_kind() {
        assert_eq!(EventKind::EmergencyState.default_severity(), Severity::Emergency);
        assert_eq!(EventKind::CriticalUsage.default_severity(), Severity::Critical);
        assert_eq!(EventKind::GrowthSpike.default_severity(), Severity::Warning);
        assert_eq!(EventKind::CompressionCompleted.default_severity(), Severity::Info);
    }

    #[test]
    fn handlers_see_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        bus.add_handler(FnEventHandler::new(move |e| {
            a.lock().unwrap().push(format!("a:{}", e.kind));
        }));
        let b = seen.clone();
        bus.add_handler(FnEventHandler::new(move |e| {
            b.lock().unwrap().push(format!("b:{}", e.kind));
        }));

        bus.emit(WardenEvent::new(EventKind::GrowthSpike, snapshot()));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:growth-spike".to_string(), "b:growth-spike".to_string()]
        );
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(
            WardenEvent::new(EventKind::CompressionNeeded, snapshot())
                .with_details(serde_json::json!({"threshold": 0.85})),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CompressionNeeded);
        assert_eq!(event.details["threshold"], 0.85);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(WardenEvent::new(EventKind::CriticalUsage, snapshot()));
    }

    #[test]
    fn composite_calls_every_handler() {
        let count = Arc::new(Mutex::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let composite = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| *c1.lock().unwrap() += 1))
            .with_if(false, NoopHandler)
            .with(FnEventHandler::new(move |_| *c2.lock().unwrap() += 1));
        composite.on_event(&WardenEvent::new(EventKind::EfficiencyDrop, snapshot()));
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn event_serializes_kebab_kind() {
        let event = WardenEvent::new(EventKind::LimitApproaching, snapshot());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "limit-approaching");
        assert_eq!(json["severity"], "warning");
    }
}
