//! Keyword extraction: reduce text to a bag of its most telling words.

use super::text::keyword_scores;
use super::{CompressionResult, CompressionStrategy, token_budget};
use crate::item::{CHARS_PER_TOKEN, estimate_tokens};

/// Keep the top-scoring words that fit in `target_ratio` of the original
/// tokens. The output is space-separated, best word first.
pub fn extract_keywords(text: &str, target_ratio: f64) -> CompressionResult {
    let label = CompressionStrategy::KeywordExtraction.label();
    let original_tokens = estimate_tokens(text);
    if original_tokens == 0 {
        return CompressionResult::unchanged(text, label);
    }
    let max_chars = token_budget(original_tokens, target_ratio) * CHARS_PER_TOKEN;

    let mut ranked: Vec<(String, f64)> = keyword_scores(text).into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut kept: Vec<String> = Vec::new();
    let mut chars = 0;
    for (word, _) in ranked {
        let cost = word.chars().count() + usize::from(!kept.is_empty());
        if chars + cost > max_chars {
            continue;
        }
        chars += cost;
        kept.push(word);
    }
    CompressionResult::from_texts(text, kept.join(" "), label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_a_bag_of_keywords() {
        let text = "The database connection timed out while the server was handling \
                    the request. The database retried the connection twice.";
        let result = extract_keywords(text, 0.4);
        assert!(result.success);
        assert!(result.compressed.contains("database"));
        assert!(!result.compressed.split(' ').any(|w| w == "the"));
        assert!(result.compressed_tokens < result.original_tokens);
    }

    #[test]
    fn numerals_are_dropped() {
        let result = extract_keywords("error 404 error 500 error 503 upstream gateway", 0.9);
        assert!(!result.compressed.contains("404"));
    }
}
