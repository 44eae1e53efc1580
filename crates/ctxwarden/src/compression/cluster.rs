//! Semantic clustering: group similar paragraphs and shrink each group.

use super::summarize::rank_sentences;
use super::text::{jaccard, split_sentences, truncate_chars, word_set};
use super::{CompressionResult, CompressionStrategy};
use crate::item::estimate_tokens;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Paragraphs join a cluster above this word overlap.
const CLUSTER_SIMILARITY: f64 = 0.3;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("valid regex literal"));

struct Cluster {
    members: Vec<usize>,
    words: HashSet<String>,
}

/// Cluster paragraphs by word overlap. Multi-paragraph clusters keep
/// `ceil(sentences × ratio)` of their best sentences; singletons are cut to
/// `ratio` of their characters.
pub fn cluster_compress(text: &str, target_ratio: f64) -> CompressionResult {
    let label = CompressionStrategy::SemanticClustering.label();
    if estimate_tokens(text) == 0 {
        return CompressionResult::unchanged(text, label);
    }
    let paragraphs: Vec<&str> = PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let mut clusters: Vec<Cluster> = Vec::new();
    for (idx, paragraph) in paragraphs.iter().enumerate() {
        let words = word_set(paragraph);
        match clusters
            .iter_mut()
            .find(|c| jaccard(&c.words, &words) > CLUSTER_SIMILARITY)
        {
            Some(cluster) => {
                cluster.members.push(idx);
                cluster.words.extend(words);
            }
            None => clusters.push(Cluster {
                members: vec![idx],
                words,
            }),
        }
    }

    let ratio = target_ratio.clamp(0.0, 1.0);
    let parts: Vec<String> = clusters
        .iter()
        .map(|cluster| {
            if let [only] = cluster.members.as_slice() {
                shorten_paragraph(paragraphs[*only], ratio)
            } else {
                let joined = cluster
                    .members
                    .iter()
                    .map(|&i| paragraphs[i])
                    .collect::<Vec<_>>()
                    .join("\n");
                summarize_cluster(&joined, ratio)
            }
        })
        .filter(|p| !p.is_empty())
        .collect();

    CompressionResult::from_texts(text, parts.join("\n\n"), label)
}

fn shorten_paragraph(paragraph: &str, ratio: f64) -> String {
    let chars = paragraph.chars().count();
    let keep = (chars as f64 * ratio).ceil() as usize;
    if keep >= chars {
        return paragraph.to_string();
    }
    format!("{}...", truncate_chars(paragraph, keep).trim_end())
}

fn summarize_cluster(text: &str, ratio: f64) -> String {
    let sentences = split_sentences(text);
    let keep = ((sentences.len() as f64 * ratio).ceil() as usize).max(1);
    let mut chosen: Vec<usize> = rank_sentences(&sentences, text).into_iter().take(keep).collect();
    chosen.sort_unstable();
    chosen
        .into_iter()
        .map(|i| sentences[i].as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similar_paragraphs_merge() {
        let text = "The parser reads tokens from the lexer. The parser builds a tree.\n\n\
                    The parser reads tokens and reports errors. The parser recovers.\n\n\
                    Deployment uses a container image pushed to the registry nightly.";
        let result = cluster_compress(text, 0.5);
        assert!(result.success);
        // Two clusters: the parser pair and the deployment singleton.
        assert_eq!(result.compressed.split("\n\n").count(), 2);
        assert!(result.compressed_tokens < result.original_tokens);
    }

    #[test]
    fn singleton_is_truncated_with_ellipsis() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let result = cluster_compress(text, 0.5);
        assert!(result.compressed.ends_with("..."));
    }
}
