//! Small text utilities shared by the strategies: sentence and word
//! splitting, stop words, the technical vocabulary, and char-safe slicing.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

pub(crate) const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as",
    "at", "be", "because", "been", "before", "being", "below", "between", "both", "but", "by",
    "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how",
    "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more", "most", "my",
    "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours",
    "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
];

pub(crate) const TECHNICAL_TERMS: &[&str] = &[
    "api", "async", "await", "bug", "build", "cache", "class", "compile", "config", "const",
    "database", "debug", "deploy", "endpoint", "enum", "error", "exception", "function", "impl",
    "import", "interface", "module", "mutex", "null", "package", "panic", "parse", "query",
    "request", "response", "return", "schema", "server", "stack", "struct", "test", "thread",
    "timeout", "token", "trait", "type", "undefined", "variable", "warning",
];

static STOP_SET: LazyLock<HashSet<&'static str>> = LazyLock::new(|| STOP_WORDS.iter().copied().collect());
static TECH_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| TECHNICAL_TERMS.iter().copied().collect());

pub(crate) fn is_stop_word(word: &str) -> bool {
    STOP_SET.contains(word)
}

pub(crate) fn is_technical_term(word: &str) -> bool {
    TECH_SET.contains(word)
}

/// Split prose into sentences on `.`, `!`, `?` followed by whitespace, and
/// on line breaks. Terminators stay with their sentence.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if matches!(c, '.' | '!' | '?') && chars.peek().is_none_or(|n| n.is_whitespace()) {
                let s = current.trim();
                if !s.is_empty() {
                    sentences.push(s.to_string());
                }
                current.clear();
            }
        }
        let s = current.trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
    }
    sentences
}

/// Alphanumeric words (underscores kept), original case.
pub(crate) fn raw_words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
}

/// Lowercased content words: no stop words, no pure numerals, length > 1.
pub(crate) fn content_words(text: &str) -> Vec<String> {
    raw_words(text)
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1 && !is_stop_word(w) && !w.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

pub(crate) fn word_set(text: &str) -> HashSet<String> {
    content_words(text).into_iter().collect()
}

/// Jaccard overlap of two word sets. Two empty sets overlap by zero.
pub(crate) fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

/// The `n` highest-scoring keywords of `text`, best first.
///
/// Score: frequency, a length bonus, +1 for technical vocabulary, +0.3 if
/// the word ever appears capitalized.
pub(crate) fn top_keywords(text: &str, n: usize) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = keyword_scores(text).into_iter().collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.into_iter().take(n).map(|(w, _)| w).collect()
}

pub(crate) fn keyword_scores(text: &str) -> HashMap<String, f64> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    let mut capitalized: HashSet<String> = HashSet::new();
    for raw in raw_words(text) {
        let lower = raw.to_lowercase();
        if lower.chars().count() <= 1 || is_stop_word(&lower) || lower.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if raw.chars().next().is_some_and(char::is_uppercase) {
            capitalized.insert(lower.clone());
        }
        *freq.entry(lower).or_default() += 1;
    }
    freq.into_iter()
        .map(|(word, count)| {
            let len = word.chars().count();
            let mut score = count as f64 + (len.min(12) as f64 / 12.0) * 0.5;
            if is_technical_term(&word) {
                score += 1.0;
            }
            if capitalized.contains(&word) {
                score += 0.3;
            }
            (word, score)
        })
        .collect()
}

/// Share of `concepts` that still appear in `text` (case-insensitive).
pub(crate) fn retained_concepts(concepts: &[String], text: &str) -> Vec<String> {
    let present = word_set(text);
    concepts
        .iter()
        .filter(|c| present.contains(c.as_str()))
        .cloned()
        .collect()
}

/// First `max_chars` characters, cut on a char boundary.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Collapse runs of whitespace to a single space (newlines preserved as
/// single newlines) and trim each line.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    let mut out = Vec::new();
    let mut blank = false;
    for line in text.lines() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if squeezed.is_empty() {
            if !blank && !out.is_empty() {
                out.push(String::new());
            }
            blank = true;
        } else {
            out.push(squeezed);
            blank = false;
        }
    }
    while out.last().is_some_and(String::is_empty) {
        out.pop();
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_on_terminators_and_lines() {
        let s = split_sentences("First one. Second one! Third?\nFourth line");
        assert_eq!(s, vec!["First one.", "Second one!", "Third?", "Fourth line"]);
    }

    #[test]
    fn decimals_do_not_split() {
        let s = split_sentences("Version 1.5 shipped. Done.");
        assert_eq!(s, vec!["Version 1.5 shipped.", "Done."]);
    }

    #[test]
    fn content_words_drop_stop_words_and_numbers() {
        let words = content_words("The parser returned 42 errors in the Module");
        assert_eq!(words, vec!["parser", "returned", "errors", "module"]);
    }

    #[test]
    fn jaccard_bounds() {
        let a = word_set("alpha beta gamma");
        let b = word_set("alpha beta delta");
        let j = jaccard(&a, &b);
        assert!((j - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[test]
    fn technical_and_frequent_words_rank_first() {
        let kw = top_keywords("cache miss. cache hit. banana. cache again", 2);
        assert_eq!(kw[0], "cache");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(collapse_whitespace("  a   b \n\n\n c  \n\n"), "a b\n\nc");
    }
}
