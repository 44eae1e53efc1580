//! Progressive detail: keep the most structurally important lines.

use super::{CompressionResult, CompressionStrategy, token_budget};
use crate::item::estimate_tokens;
use regex::Regex;
use std::sync::LazyLock;

static DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:pub(?:\([^)]*\))?\s+|export\s+|async\s+)*(?:fn|def|class|struct|enum|trait|impl|interface|type|function|const|let|var|static|mod|import|from|use|package|#include|require)\b",
    )
    .expect("valid regex literal")
});

static DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:error|warn(?:ing)?|fail(?:ed|ure)?|exception|panic(?:ked)?|fatal)\b")
        .expect("valid regex literal")
});

static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?://|#|/\*|\*|--|<!--)").expect("valid regex literal"));

const LONG_LINE_CHARS: usize = 200;

/// Importance of one line in `[0, 1]`.
pub(crate) fn line_importance(line: &str) -> f64 {
    if line.trim().is_empty() {
        return 0.1;
    }
    let mut score: f64 = 0.3;
    if DECLARATION.is_match(line) {
        score += 0.4;
    }
    if DIAGNOSTIC.is_match(line) {
        score += 0.5;
    }
    if COMMENT.is_match(line) {
        score += 0.1;
    }
    if line.chars().count() > LONG_LINE_CHARS {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// Keep the highest-importance lines that fit the token budget, in their
/// original order.
pub fn progressive_detail(text: &str, target_ratio: f64) -> CompressionResult {
    let label = CompressionStrategy::ProgressiveDetail.label();
    let original_tokens = estimate_tokens(text);
    if original_tokens == 0 {
        return CompressionResult::unchanged(text, label);
    }
    let budget = token_budget(original_tokens, target_ratio);
    let lines: Vec<&str> = text.lines().collect();

    let mut ranked: Vec<(usize, f64)> = lines
        .iter()
        .enumerate()
        .map(|(i, l)| (i, line_importance(l)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut used = 0;
    let mut kept = Vec::new();
    for (idx, _) in ranked {
        // Blank lines still cost a token so they cannot flood the output.
        let cost = estimate_tokens(lines[idx]).max(1);
        if used + cost <= budget {
            used += cost;
            kept.push(idx);
        }
    }
    kept.sort_unstable();
    let compressed = kept.iter().map(|&i| lines[i]).collect::<Vec<_>>().join("\n");
    CompressionResult::from_texts(text, compressed, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_rules() {
        assert!((line_importance("") - 0.1).abs() < 1e-9);
        assert!((line_importance("x = y + 1") - 0.3).abs() < 1e-9);
        assert!((line_importance("pub fn main() {") - 0.7).abs() < 1e-9);
        assert!((line_importance("// a note") - 0.4).abs() < 1e-9);
        assert!(line_importance("ERROR: disk full") >= 0.8);
        let long = format!("x = {}", "y".repeat(250));
        assert!((line_importance(&long) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn declarations_survive_and_order_is_kept() {
        let text = "use std::fmt;\n\
                    let a = compute_something_long(1, 2, 3);\n\
                    let b = compute_something_long(4, 5, 6);\n\
                    x = y + z * w - v / u;\n\
                    q = r + s * t - p / o;\n\
                    fn helper() -> u32 { 4 }\n\
                    m = n + o * p - q / r;";
        let result = progressive_detail(text, 0.5);
        assert!(result.success);
        let use_pos = result.compressed.find("use std::fmt;");
        let fn_pos = result.compressed.find("fn helper");
        assert!(use_pos.is_some() && fn_pos.is_some());
        assert!(use_pos < fn_pos);
    }
}
