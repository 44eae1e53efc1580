//! Configuration for every component, loadable from JSON.
//!
//! Each component has its own struct with sensible defaults; the top-level
//! [`WardenConfig`] bundles them. All structs use `#[serde(default)]` so a
//! config file only needs the fields it overrides.
//!
//! # Examples
//!
//! Defaults with a couple of overrides:
//!
//! ```ignore
//! let config = WardenConfig::default()
//!     .with_total_tokens(64_000)
//!     .with_compression_thresholds(0.8, 0.9);
//! ```
//!
//! From a file, validated against the generated JSON Schema first:
//!
//! ```ignore
//! let config = WardenConfig::load("ctxwarden.json")?;
//! ```

use crate::compression::CompressionStrategy;
use crate::error::{Result, WardenError};
use crate::fallback::FallbackStrategy;
use crate::item::SectionName;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ── Window ─────────────────────────────────────────────────────────

/// Static share of the window budget for each section. Must sum to ~1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SectionRatios {
    pub system: f64,
    pub conversation: f64,
    pub code: f64,
    pub project: f64,
    pub memory: f64,
}

impl Default for SectionRatios {
    fn default() -> Self {
        Self {
            system: 0.10,
            conversation: 0.30,
            code: 0.35,
            project: 0.15,
            memory: 0.10,
        }
    }
}

impl SectionRatios {
    pub fn get(&self, name: SectionName) -> f64 {
        match name {
            SectionName::System => self.system,
            SectionName::Conversation => self.conversation,
            SectionName::Code => self.code,
            SectionName::Project => self.project,
            SectionName::Memory => self.memory,
        }
    }

    pub fn set(&mut self, name: SectionName, ratio: f64) {
        match name {
            SectionName::System => self.system = ratio,
            SectionName::Conversation => self.conversation = ratio,
            SectionName::Code => self.code = ratio,
            SectionName::Project => self.project = ratio,
            SectionName::Memory => self.memory = ratio,
        }
    }

    pub fn sum(&self) -> f64 {
        SectionName::ALL.iter().map(|&n| self.get(n)).sum()
    }
}

/// Budget and allocation settings for one [`ContextWindowManager`](crate::window::ContextWindowManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WindowConfig {
    /// Total token capacity of the window.
    pub total_tokens: usize,
    /// Static per-section allocation ratios.
    pub allocation: SectionRatios,
    /// Floor for every section's `max_tokens`.
    pub min_tokens_per_section: usize,
    /// Fraction of `total_tokens` held back from section allocation.
    pub buffer_percentage: f64,
    /// Section utilization above which a section is optimized.
    pub compression_threshold: f64,
    /// Rebalance section capacities from observed usage.
    pub dynamic_allocation: bool,
    /// Minimum spacing between automatic full-window optimizations.
    pub min_optimization_interval_ms: u64,
    /// Number of usage samples averaged for observed usage.
    pub usage_sample_window: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            total_tokens: 128_000,
            allocation: SectionRatios::default(),
            min_tokens_per_section: 1_000,
            buffer_percentage: 0.10,
            compression_threshold: 0.80,
            dynamic_allocation: true,
            min_optimization_interval_ms: 30_000,
            usage_sample_window: 10,
        }
    }
}

impl WindowConfig {
    /// Tokens distributed across sections: total minus the buffer.
    pub fn available_budget(&self) -> usize {
        (self.total_tokens as f64 * (1.0 - self.buffer_percentage)).floor() as usize
    }

    /// Capacity a section starts with, before any rebalancing.
    pub fn initial_capacity(&self, name: SectionName) -> usize {
        let share = (self.available_budget() as f64 * self.allocation.get(name)).floor() as usize;
        share.max(self.min_tokens_per_section)
    }

    pub fn min_optimization_interval(&self) -> Duration {
        Duration::from_millis(self.min_optimization_interval_ms)
    }
}

// ── Prioritizer ────────────────────────────────────────────────────

/// Weights of the four scoring factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScoringWeights {
    pub recency: f64,
    pub relevance: f64,
    pub interaction: f64,
    pub dependency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            relevance: 0.4,
            interaction: 0.2,
            dependency: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PrioritizerConfig {
    pub weights: ScoringWeights,
    /// Items scoring below this are removal candidates.
    pub min_relevance_threshold: f64,
    /// Items idle longer than this are removal candidates.
    pub max_age_hours: f64,
    /// Score above which an item is critical.
    pub critical_score: f64,
    /// Score below which an item is compressed.
    pub compress_score: f64,
    /// Dependency sub-score that protects an item from removal.
    pub dependency_protection: f64,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            min_relevance_threshold: 0.3,
            max_age_hours: 24.0,
            critical_score: 0.8,
            compress_score: 0.6,
            dependency_protection: 0.3,
        }
    }
}

// ── Compression ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompressionConfig {
    /// Ratio requested when a section is optimized.
    pub target_ratio: f64,
    /// Strategy for content types without a dedicated mapping.
    pub default_strategy: CompressionStrategy,
    /// Code longer than this (chars) is clustered rather than keyword-extracted.
    pub clustering_threshold_chars: usize,
    /// Simultaneous item compressions in a batch.
    pub batch_concurrency: usize,
    /// Maximum cached compression results.
    pub cache_capacity: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            target_ratio: 0.6,
            default_strategy: CompressionStrategy::Summarization,
            clustering_threshold_chars: 2_000,
            batch_concurrency: 5,
            cache_capacity: 256,
        }
    }
}

// ── Fallback ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FallbackConfig {
    /// Ladder rungs attempted before giving up.
    pub max_fallback_attempts: usize,
    /// Time limit for a single rung.
    pub fallback_timeout_ms: u64,
    /// Allow the emergency purge when every rung fails.
    pub enable_emergency_removal: bool,
    /// Share of the original tokens an emergency purge always keeps.
    pub min_preservation_ratio: f64,
    /// A rung succeeds when its ratio is at most `target * (1 + tolerance)`.
    pub success_tolerance: f64,
    /// Listed strategies run first, lowest value first; the rest follow in
    /// ladder order.
    pub strategy_priorities: BTreeMap<FallbackStrategy, u8>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_fallback_attempts: 8,
            fallback_timeout_ms: 5_000,
            enable_emergency_removal: true,
            min_preservation_ratio: 0.1,
            success_tolerance: 0.2,
            strategy_priorities: BTreeMap::new(),
        }
    }
}

impl FallbackConfig {
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

// ── Auto-compression ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AutoCompressionConfig {
    /// Aggregate limit; `None` uses the sum of registered window totals.
    pub max_token_limit: Option<usize>,
    pub compression_threshold: f64,
    pub emergency_threshold: f64,
    /// Predictive triggering only applies at or above this utilization.
    pub predictive_threshold: f64,
    /// Trigger early if the limit is projected within this many minutes.
    pub prediction_horizon_minutes: f64,
    pub target_compression_ratio: f64,
    pub monitoring_interval_ms: u64,
    pub min_compression_interval_ms: u64,
    /// Cap per process lifetime.
    pub max_compression_attempts: u32,
    pub snapshot_cache_ms: u64,
    pub history_size: usize,
}

impl Default for AutoCompressionConfig {
    fn default() -> Self {
        Self {
            max_token_limit: None,
            compression_threshold: 0.85,
            emergency_threshold: 0.95,
            predictive_threshold: 0.70,
            prediction_horizon_minutes: 30.0,
            target_compression_ratio: 0.6,
            monitoring_interval_ms: 30_000,
            min_compression_interval_ms: 60_000,
            max_compression_attempts: 50,
            snapshot_cache_ms: 5_000,
            history_size: 100,
        }
    }
}

impl AutoCompressionConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn min_compression_interval(&self) -> Duration {
        Duration::from_millis(self.min_compression_interval_ms)
    }

    pub fn snapshot_cache(&self) -> Duration {
        Duration::from_millis(self.snapshot_cache_ms)
    }
}

// ── Monitor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub high_frequency_interval_ms: u64,
    /// Utilization at which polling switches to the high-frequency interval.
    pub high_frequency_threshold: f64,
    /// Aggregate limit; `None` uses the sum of registered window totals.
    pub max_token_limit: Option<usize>,
    /// Utilization levels that emit `ThresholdCrossed` when crossed upward.
    pub alert_thresholds: Vec<f64>,
    pub compression_threshold: f64,
    pub critical_threshold: f64,
    pub emergency_threshold: f64,
    pub prediction_horizon_minutes: f64,
    pub growth_spike_tokens_per_minute: f64,
    /// Drop in efficiency score between polls that emits `EfficiencyDrop`.
    pub efficiency_drop: f64,
    pub min_opportunity_tokens: usize,
    pub max_snapshots: usize,
    pub snapshot_retention_ms: u64,
    pub max_events: usize,
    pub event_retention_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            high_frequency_interval_ms: 2_000,
            high_frequency_threshold: 0.80,
            max_token_limit: None,
            alert_thresholds: vec![0.50, 0.75, 0.85, 0.95],
            compression_threshold: 0.85,
            critical_threshold: 0.90,
            emergency_threshold: 0.95,
            prediction_horizon_minutes: 30.0,
            growth_spike_tokens_per_minute: 5_000.0,
            efficiency_drop: 0.10,
            min_opportunity_tokens: 500,
            max_snapshots: 1_000,
            snapshot_retention_ms: 3_600_000,
            max_events: 500,
            event_retention_ms: 86_400_000,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn high_frequency_interval(&self) -> Duration {
        Duration::from_millis(self.high_frequency_interval_ms)
    }
}

// ── Top level ──────────────────────────────────────────────────────

/// Every tunable in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WardenConfig {
    pub window: WindowConfig,
    pub prioritizer: PrioritizerConfig,
    pub compression: CompressionConfig,
    pub fallback: FallbackConfig,
    pub auto_compression: AutoCompressionConfig,
    pub monitor: MonitorConfig,
}

impl WardenConfig {
    pub fn with_total_tokens(mut self, tokens: usize) -> Self {
        self.window.total_tokens = tokens;
        self
    }

    pub fn with_allocation(mut self, allocation: SectionRatios) -> Self {
        self.window.allocation = allocation;
        self
    }

    pub fn with_min_tokens_per_section(mut self, tokens: usize) -> Self {
        self.window.min_tokens_per_section = tokens;
        self
    }

    /// Set the auto-compression warning and emergency thresholds.
    pub fn with_compression_thresholds(mut self, warning: f64, emergency: f64) -> Self {
        self.auto_compression.compression_threshold = warning;
        self.auto_compression.emergency_threshold = emergency;
        self
    }

    pub fn with_target_ratio(mut self, ratio: f64) -> Self {
        self.compression.target_ratio = ratio;
        self.auto_compression.target_compression_ratio = ratio;
        self
    }

    /// JSON Schema of the configuration document.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(WardenConfig);
        serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    /// Parse, schema-check, and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let schema = Self::json_schema();
        let validator =
            jsonschema::validator_for(&schema).map_err(|e| WardenError::Schema(e.to_string()))?;
        let errors: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| format!("  - {}: {e}", e.instance_path()))
            .collect();
        if !errors.is_empty() {
            return Err(WardenError::Schema(errors.join("\n")));
        }
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check cross-field consistency. Errors here are programming or
    /// deployment mistakes, not resource conditions.
    pub fn validate(&self) -> Result<()> {
        let w = &self.window;
        if w.total_tokens == 0 {
            return Err(WardenError::Config("window.total_tokens must be positive".into()));
        }
        if !(0.0..=0.5).contains(&w.buffer_percentage) {
            return Err(WardenError::Config(format!(
                "window.buffer_percentage {} outside [0, 0.5]",
                w.buffer_percentage
            )));
        }
        for name in SectionName::ALL {
            let ratio = w.allocation.get(name);
            if !(0.0..=1.0).contains(&ratio) {
                return Err(WardenError::Config(format!(
                    "allocation ratio for {name} is {ratio}, expected [0, 1]"
                )));
            }
        }
        let tolerance = w.buffer_percentage.max(0.01);
        let sum = w.allocation.sum();
        if (sum - 1.0).abs() > tolerance {
            return Err(WardenError::Config(format!(
                "allocation ratios sum to {sum:.3}, expected 1.0 ± {tolerance:.2}"
            )));
        }
        check_fraction("window.compression_threshold", w.compression_threshold)?;
        if w.usage_sample_window == 0 {
            return Err(WardenError::Config("window.usage_sample_window must be positive".into()));
        }

        let weights = &self.prioritizer.weights;
        let all = [
            weights.recency,
            weights.relevance,
            weights.interaction,
            weights.dependency,
        ];
        if all.iter().any(|w| *w < 0.0) || all.iter().sum::<f64>() <= 0.0 {
            return Err(WardenError::Config(
                "prioritizer weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.prioritizer.max_age_hours <= 0.0 {
            return Err(WardenError::Config("prioritizer.max_age_hours must be positive".into()));
        }

        check_ratio("compression.target_ratio", self.compression.target_ratio)?;
        if self.compression.batch_concurrency == 0 {
            return Err(WardenError::Config("compression.batch_concurrency must be at least 1".into()));
        }

        if self.fallback.max_fallback_attempts == 0 {
            return Err(WardenError::Config("fallback.max_fallback_attempts must be at least 1".into()));
        }
        if self.fallback.fallback_timeout_ms == 0 {
            return Err(WardenError::Config("fallback.fallback_timeout_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.fallback.min_preservation_ratio) {
            return Err(WardenError::Config(
                "fallback.min_preservation_ratio must be within [0, 1]".into(),
            ));
        }

        let a = &self.auto_compression;
        check_fraction("auto_compression.compression_threshold", a.compression_threshold)?;
        check_fraction("auto_compression.emergency_threshold", a.emergency_threshold)?;
        if a.emergency_threshold < a.compression_threshold {
            return Err(WardenError::Config(
                "auto_compression.emergency_threshold must not be below compression_threshold".into(),
            ));
        }
        check_ratio("auto_compression.target_compression_ratio", a.target_compression_ratio)?;
        if a.monitoring_interval_ms == 0 || a.history_size == 0 {
            return Err(WardenError::Config(
                "auto_compression.monitoring_interval_ms and history_size must be positive".into(),
            ));
        }

        let m = &self.monitor;
        if m.interval_ms == 0 || m.high_frequency_interval_ms == 0 {
            return Err(WardenError::Config("monitor intervals must be positive".into()));
        }
        check_fraction("monitor.high_frequency_threshold", m.high_frequency_threshold)?;
        Ok(())
    }
}

fn check_fraction(field: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(WardenError::Config(format!("{field} is {value}, expected (0, 1]")))
    }
}

fn check_ratio(field: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(WardenError::Config(format!("{field} is {value}, expected (0, 1)")))
    }
}
