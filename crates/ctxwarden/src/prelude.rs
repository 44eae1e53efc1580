//! Convenience re-exports for common `ctxwarden` types.
//!
//! ```ignore
//! use ctxwarden::prelude::*;
//! ```
//!
//! Specialized types (cache internals, content detection, snapshot
//! plumbing) are left out; import those from their modules.

// ── Items ───────────────────────────────────────────────────────────
pub use crate::item::{
    ContentType, ContextItem, ContextSection, ContextWindow, Priority, SectionName,
    estimate_tokens,
};

// ── Configuration and errors ────────────────────────────────────────
pub use crate::config::{SectionRatios, WardenConfig};
pub use crate::error::{CompressionError, WardenError};

// ── Window management ───────────────────────────────────────────────
pub use crate::prioritizer::{ContextPrioritizer, PrioritizationResult, WorkingContext};
pub use crate::session::SessionContext;
pub use crate::window::{AllocationStats, ContextWindowManager, SharedWindow};

// ── Compression ─────────────────────────────────────────────────────
pub use crate::compression::{
    CompressionResult, CompressionStrategy, ContextCompressor, EnhancedCompressor,
    TextCompressor,
};
pub use crate::fallback::{FallbackResult, FallbackStrategy, FallbackSystem};

// ── Background services and events ──────────────────────────────────
pub use crate::auto::{AutoCompressionManager, CompressionReport, Urgency};
pub use crate::events::{
    CompositeEventHandler, EventBus, EventHandler, EventKind, FnEventHandler, LoggingHandler,
    NoopHandler, Severity, WardenEvent,
};
pub use crate::monitor::{DetailedSnapshot, TokenMonitor};
pub use crate::snapshot::TokenUsageSnapshot;
