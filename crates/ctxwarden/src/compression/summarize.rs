//! Extractive summarization: keep the best-scoring sentences.

use super::text::{content_words, split_sentences, top_keywords, truncate_chars};
use super::{CompressionResult, CompressionStrategy, token_budget};
use crate::item::{CHARS_PER_TOKEN, estimate_tokens};
use std::collections::HashSet;

const MAX_KEYWORD_BONUS: f64 = 0.5;

/// Score sentences by length band, position, and keyword hits, pack the
/// best ones into `target_ratio` of the original tokens, and reassemble
/// them in their original order.
pub fn summarize(text: &str, target_ratio: f64) -> CompressionResult {
    let label = CompressionStrategy::Summarization.label();
    let original_tokens = estimate_tokens(text);
    if original_tokens == 0 {
        return CompressionResult::unchanged(text, label);
    }
    let budget = token_budget(original_tokens, target_ratio);
    let sentences = split_sentences(text);
    let selected = select_sentences(&sentences, budget, text);

    let compressed = if selected.is_empty() {
        // Nothing fits whole; cut the best sentence to the budget instead.
        let best = rank_sentences(&sentences, text).into_iter().next();
        match best {
            Some(idx) => truncate_chars(&sentences[idx], budget * CHARS_PER_TOKEN).to_string(),
            None => String::new(),
        }
    } else {
        selected
            .iter()
            .map(|&i| sentences[i].as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };
    CompressionResult::from_texts(text, compressed, label)
}

/// Indices of sentences chosen greedily by score under `budget` tokens,
/// returned in original order.
pub(crate) fn select_sentences(sentences: &[String], budget: usize, context: &str) -> Vec<usize> {
    let mut used = 0;
    let mut chosen = Vec::new();
    for idx in rank_sentences(sentences, context) {
        let cost = estimate_tokens(&sentences[idx]);
        if used + cost <= budget {
            used += cost;
            chosen.push(idx);
        }
    }
    chosen.sort_unstable();
    chosen
}

/// Sentence indices ordered best first. Ties keep document order.
pub(crate) fn rank_sentences(sentences: &[String], context: &str) -> Vec<usize> {
    let keywords: HashSet<String> = top_keywords(context, 10).into_iter().collect();
    let last = sentences.len().saturating_sub(1);
    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| (i, score_sentence(s, i, last, &keywords)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.into_iter().map(|(i, _)| i).collect()
}

fn score_sentence(sentence: &str, index: usize, last: usize, keywords: &HashSet<String>) -> f64 {
    let mut score = 0.0;
    let words = sentence.split_whitespace().count();
    if (5..=30).contains(&words) {
        score += 0.3;
    }
    if index == 0 {
        score += 0.3;
    } else if index == last {
        score += 0.2;
    }
    let hits: HashSet<String> = content_words(sentence)
        .into_iter()
        .filter(|w| keywords.contains(w))
        .collect();
    score += (hits.len() as f64 * 0.1).min(MAX_KEYWORD_BONUS);
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "The cache layer stores compiled templates for reuse. \
        Weather today was pleasant and mild. \
        Each cache entry is keyed by template path and hash. \
        Lunch was a sandwich. \
        Cache eviction removes the oldest template first when the cache is full.";

    #[test]
    fn keeps_first_sentence_and_shrinks() {
        let result = summarize(TEXT, 0.6);
        assert!(result.success);
        assert!(result.compressed_tokens < result.original_tokens);
        assert!(result.compressed.starts_with("The cache layer"));
    }

    #[test]
    fn sentences_stay_in_original_order() {
        let result = summarize(TEXT, 0.7);
        let first = result.compressed.find("The cache layer");
        let later = result.compressed.find("Cache eviction");
        if let (Some(a), Some(b)) = (first, later) {
            assert!(a < b);
        }
    }

    #[test]
    fn single_long_sentence_is_cut_to_budget() {
        let text = "word ".repeat(200);
        let result = summarize(&text, 0.3);
        assert!(result.success);
        assert!(result.compressed_tokens <= result.original_tokens);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let result = summarize("", 0.5);
        assert!(!result.success);
        assert_eq!(result.compressed, "");
    }
}
