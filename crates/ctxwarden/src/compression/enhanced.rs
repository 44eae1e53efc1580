//! Content-aware compression.
//!
//! [`EnhancedCompressor`] detects what a text is (JSON, an error log,
//! markup, source code, ...) and applies the matching transform, reporting
//! a quality score alongside the usual [`CompressionResult`]. Unlike the
//! base strategies it returns `Err` on failure so the caller can route the
//! error to the fallback system.

use super::detect::{ContentCategory, detect_content};
use super::text::top_keywords;
use super::{CompressionResult, transforms};
use crate::error::CompressionError;
use serde::Serialize;

/// Inputs longer than this are refused as a resource limit.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 2_000_000;

/// A successful content-aware compression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedCompression {
    #[serde(flatten)]
    pub result: CompressionResult,
    pub category: ContentCategory,
    /// Heuristic quality in `[0, 1]`.
    pub quality: f64,
}

/// A compressor the auto-compression pipeline can call per item.
///
/// Implementations run on blocking worker threads.
pub trait TextCompressor: Send + Sync {
    fn compress(&self, text: &str, target_ratio: f64)
    -> Result<EnhancedCompression, CompressionError>;
}

/// Detects content categories and dispatches to category transforms.
#[derive(Debug, Clone)]
pub struct EnhancedCompressor {
    max_input_chars: usize,
}

impl EnhancedCompressor {
    pub fn new() -> Self {
        Self {
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }

    pub fn with_max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = chars;
        self
    }
}

impl Default for EnhancedCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl TextCompressor for EnhancedCompressor {
    fn compress(
        &self,
        text: &str,
        target_ratio: f64,
    ) -> Result<EnhancedCompression, CompressionError> {
        if text.trim().is_empty() {
            return Err(CompressionError::InvalidInput("empty content".into()));
        }
        if !(target_ratio > 0.0 && target_ratio <= 1.0) {
            return Err(CompressionError::InvalidInput(format!(
                "target ratio {target_ratio} outside (0, 1]"
            )));
        }
        let chars = text.chars().count();
        if chars > self.max_input_chars {
            return Err(CompressionError::ResourceLimit(format!(
                "{chars} chars exceeds the {} char input limit",
                self.max_input_chars
            )));
        }

        let detection = detect_content(text);
        let compressed = transforms::apply(detection.category, text, target_ratio)?;
        let strategy = format!("enhanced-{}", detection.category);
        let result = CompressionResult::from_texts(text, compressed, &strategy);
        if !result.success {
            return Err(CompressionError::InsufficientCompression {
                achieved: 1.0,
                target: target_ratio,
            });
        }
        tracing::debug!(
            "[compress] {} content: {} -> {} tokens",
            detection.category,
            result.original_tokens,
            result.compressed_tokens
        );
        let quality = quality_score(&result, text);
        Ok(EnhancedCompression {
            result,
            category: detection.category,
            quality,
        })
    }
}

/// `1 − 0.3 × loss`, plus bonuses for strong ratios and for retained
/// concepts, clamped to `[0, 1]`.
fn quality_score(result: &CompressionResult, original: &str) -> f64 {
    let mut quality = 1.0 - 0.3 * result.information_loss;
    if result.compression_ratio <= 0.5 {
        quality += 0.1;
    } else if result.compression_ratio <= 0.7 {
        quality += 0.05;
    }
    let concepts = top_keywords(original, 10).len();
    if concepts > 0 {
        quality += 0.1 * result.preserved_concepts.len() as f64 / concepts as f64;
    }
    quality.clamp(0.0, 1.0)
}

/// Whether a compressed text is within `tolerance` of the requested ratio.
pub fn meets_target(
    compressed_tokens: usize,
    original_tokens: usize,
    target: f64,
    tolerance: f64,
) -> bool {
    if original_tokens == 0 {
        return false;
    }
    let ratio = compressed_tokens as f64 / original_tokens as f64;
    ratio <= target * (1.0 + tolerance)
}
