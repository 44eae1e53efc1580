//! Category-specific transforms used by the enhanced compressor.
//!
//! Each transform returns the shrunken text; scoring and result assembly
//! happen in [`enhanced`](super::enhanced).

use super::detect::ContentCategory;
use super::text::{collapse_whitespace, split_sentences};
use super::{progressive_detail, summarize, token_budget};
use crate::error::CompressionError;
use crate::item::estimate_tokens;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

/// Object fields kept when JSON is pruned.
const JSON_PRIORITY_FIELDS: &[&str] = &[
    "id", "name", "type", "status", "error", "message", "code", "title", "key", "version",
];

const MAX_WARN_LINES: usize = 5;
const MAX_STACK_LINES: usize = 10;
const MARKDOWN_BODY_LIMIT: usize = 200;
const CONVERSATION_TURN_LIMIT: usize = 300;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:ERROR|FATAL|CRITICAL)\b|panicked at|^\s*\w*(?:Error|Exception):")
        .expect("valid regex literal")
});
static WARN_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bWARN(?:ING)?\b").expect("valid regex literal"));
static STACK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s+(?:at\s|File\s"|\d+:\s)|^\s*Caused by:"#).expect("valid regex literal")
});
static INTER_TAG_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s+<").expect("valid regex literal"));
static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex literal"));
static STYLE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"style\s*=\s*"([^"]*)""#).expect("valid regex literal"));
static STYLE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*([:;,])\s*").expect("valid regex literal"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s").expect("valid regex literal"));
static SPEAKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:user|assistant|human|ai|system|bot)\s*:").expect("valid regex literal")
});

/// Dispatch to the transform for `category`.
pub(crate) fn apply(
    category: ContentCategory,
    text: &str,
    ratio: f64,
) -> Result<String, CompressionError> {
    match category {
        ContentCategory::Json => compress_json(text, ratio),
        ContentCategory::ErrorLog => Ok(compress_error_log(text)),
        ContentCategory::Html | ContentCategory::Xml => Ok(compress_markup(text)),
        ContentCategory::Markdown => Ok(compress_markdown(text)),
        ContentCategory::JavaScript
        | ContentCategory::TypeScript
        | ContentCategory::Python
        | ContentCategory::Rust => Ok(compress_code(text, ratio, category)),
        ContentCategory::ConversationLog => Ok(compress_conversation(text, ratio)),
        ContentCategory::FileListing => Ok(compress_file_listing(text, ratio)),
        ContentCategory::PlainText => Ok(summarize(text, ratio).compressed),
    }
}

// ── JSON ───────────────────────────────────────────────────────────

/// Minify, then prune in levels until the token budget is met: sample
/// arrays, then drop non-priority object fields, then both harder.
pub(crate) fn compress_json(text: &str, ratio: f64) -> Result<String, CompressionError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CompressionError::Parse(e.to_string()))?;
    let budget = token_budget(estimate_tokens(text), ratio);
    let minified = value.to_string();
    if estimate_tokens(&minified) <= budget {
        return Ok(minified);
    }

    let mut best = minified;
    for level in 1..=3 {
        let mut pruned = value.clone();
        let keep_ratio = if level == 3 { ratio / 2.0 } else { ratio };
        prune_json(&mut pruned, keep_ratio, level >= 2);
        let candidate = pruned.to_string();
        if estimate_tokens(&candidate) < estimate_tokens(&best) {
            best = candidate;
        }
        if estimate_tokens(&best) <= budget {
            break;
        }
    }
    Ok(best)
}

fn prune_json(value: &mut Value, keep_ratio: f64, drop_fields: bool) {
    match value {
        Value::Array(items) => {
            let keep = ((items.len() as f64 * keep_ratio).ceil() as usize).max(1);
            if items.len() > keep {
                let dropped = items.len() - keep;
                items.truncate(keep);
                items.push(Value::String(format!("... {dropped} more")));
            }
            for item in items.iter_mut() {
                prune_json(item, keep_ratio, drop_fields);
            }
        }
        Value::Object(map) => {
            if drop_fields {
                let has_priority = map.keys().any(|k| JSON_PRIORITY_FIELDS.contains(&k.as_str()));
                if has_priority {
                    let kept: Map<String, Value> = std::mem::take(map)
                        .into_iter()
                        .filter(|(k, _)| JSON_PRIORITY_FIELDS.contains(&k.as_str()))
                        .collect();
                    *map = kept;
                }
            }
            for child in map.values_mut() {
                prune_json(child, keep_ratio, drop_fields);
            }
        }
        _ => {}
    }
}

// ── Error logs ─────────────────────────────────────────────────────

/// Keep every error line (deduplicated with a `(×N)` suffix), up to five
/// warnings, and up to ten stack-trace lines.
pub(crate) fn compress_error_log(text: &str) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for line in text.lines() {
        *counts.entry(line.trim_end()).or_default() += 1;
    }

    let mut emitted: HashSet<&str> = HashSet::new();
    let mut warns = 0;
    let mut stack = 0;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() || emitted.contains(line) {
            continue;
        }
        let keep = if ERROR_LINE.is_match(line) {
            true
        } else if WARN_LINE.is_match(line) && warns < MAX_WARN_LINES {
            warns += 1;
            true
        } else if STACK_LINE.is_match(line) && stack < MAX_STACK_LINES {
            stack += 1;
            true
        } else {
            false
        };
        if keep {
            emitted.insert(line);
            match counts.get(line).copied().unwrap_or(1) {
                1 => out.push(line.to_string()),
                n => out.push(format!("{line} (×{n})")),
            }
        }
    }
    out.join("\n")
}

// ── Markup ─────────────────────────────────────────────────────────

/// Collapse inter-tag whitespace, strip comments that are not license or
/// preserve annotations, and minify inline styles.
pub(crate) fn compress_markup(text: &str) -> String {
    let without_comments = HTML_COMMENT.replace_all(text, |caps: &regex::Captures<'_>| {
        let comment = &caps[0];
        if comment.starts_with("<!--!") || comment.contains("@license") || comment.contains("@preserve")
        {
            comment.to_string()
        } else {
            String::new()
        }
    });
    let styled = STYLE_ATTR.replace_all(&without_comments, |caps: &regex::Captures<'_>| {
        let minified = STYLE_PUNCT.replace_all(caps[1].trim(), "$1");
        format!("style=\"{}\"", minified.trim_end_matches(';'))
    });
    let collapsed = INTER_TAG_SPACE.replace_all(&styled, "><");
    collapse_whitespace(&collapsed)
}

// ── Markdown ───────────────────────────────────────────────────────

/// Shorten any section body over 200 characters to its first and last
/// sentences. Headings are kept verbatim.
pub(crate) fn compress_markdown(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut body: Vec<&str> = Vec::new();
    for line in text.lines() {
        if HEADING.is_match(line) {
            flush_markdown_body(&body, &mut out);
            body.clear();
            out.push(line.trim_end().to_string());
        } else {
            body.push(line);
        }
    }
    flush_markdown_body(&body, &mut out);
    out.join("\n")
}

fn flush_markdown_body(body: &[&str], out: &mut Vec<String>) {
    let joined = body.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.chars().count() > MARKDOWN_BODY_LIMIT {
        let sentences = split_sentences(trimmed);
        if let (Some(first), Some(last)) = (sentences.first(), sentences.last())
            && sentences.len() > 2
        {
            out.push(format!("{first} ... {last}"));
            return;
        }
    }
    out.push(trimmed.to_string());
}

// ── Code ───────────────────────────────────────────────────────────

/// Drop comment-only lines and blank runs; if that is not enough, fall
/// back to progressive detail on the stripped source.
pub(crate) fn compress_code(text: &str, ratio: f64, category: ContentCategory) -> String {
    let hash_comments = category == ContentCategory::Python;
    let mut in_block = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        let t = line.trim_start();
        if in_block {
            if t.contains("*/") {
                in_block = false;
            }
            continue;
        }
        if t.starts_with("/*") {
            in_block = !t.contains("*/");
            continue;
        }
        if t.starts_with("//") && !t.starts_with("///") && !t.starts_with("//!") {
            continue;
        }
        if hash_comments && t.starts_with('#') && !t.starts_with("#!") {
            continue;
        }
        lines.push(line.trim_end());
    }
    let stripped = collapse_blank_lines(&lines);
    let budget = token_budget(estimate_tokens(text), ratio);
    if estimate_tokens(&stripped) <= budget {
        return stripped;
    }
    let detailed = progressive_detail(&stripped, budget as f64 / estimate_tokens(&stripped).max(1) as f64);
    if detailed.success {
        detailed.compressed
    } else {
        stripped
    }
}

fn collapse_blank_lines(lines: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for &line in lines {
        if line.is_empty() && out.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

// ── Conversation logs ──────────────────────────────────────────────

/// Shorten long turns to their first sentence, then summarize the whole
/// log if it is still over budget.
pub(crate) fn compress_conversation(text: &str, ratio: f64) -> String {
    let mut turns: Vec<String> = Vec::new();
    for line in text.lines() {
        if SPEAKER.is_match(line) || turns.is_empty() {
            turns.push(line.trim_end().to_string());
        } else if let Some(current) = turns.last_mut() {
            current.push('\n');
            current.push_str(line.trim_end());
        }
    }
    let shortened: Vec<String> = turns
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .map(|turn| {
            if turn.chars().count() <= CONVERSATION_TURN_LIMIT {
                return turn;
            }
            match split_sentences(&turn).first() {
                Some(first) => format!("{first} ..."),
                None => turn,
            }
        })
        .collect();
    let joined = shortened.join("\n");
    if estimate_tokens(&joined) <= token_budget(estimate_tokens(text), ratio) {
        return joined;
    }
    let summary = summarize(&joined, ratio);
    summary.compressed
}

// ── File listings ──────────────────────────────────────────────────

/// Group paths by directory, keeping `ceil(count × ratio)` names per
/// directory and a `+N more` tail.
pub(crate) fn compress_file_listing(text: &str, ratio: f64) -> String {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in text.lines() {
        let path = line.trim().trim_start_matches(['├', '└', '│', '─', ' ']);
        if path.is_empty() {
            continue;
        }
        let (dir, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((dir, name)) => (format!("{dir}/"), name.to_string()),
            None => ("./".to_string(), path.to_string()),
        };
        groups.entry(dir).or_default().push(name);
    }
    groups
        .into_iter()
        .map(|(dir, names)| {
            let keep = ((names.len() as f64 * ratio).ceil() as usize).max(1);
            let mut shown: Vec<String> = names.iter().take(keep).cloned().collect();
            if names.len() > keep {
                shown.push(format!("+{} more", names.len() - keep));
            }
            format!("{dir}: {}", shown.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_minifies_and_prunes() {
        let items: Vec<Value> = (0..40)
            .map(|i| serde_json::json!({"id": i, "name": format!("item {i}"), "payload": "x".repeat(40)}))
            .collect();
        let text = serde_json::to_string_pretty(&serde_json::json!({"items": items})).unwrap();
        let out = compress_json(&text, 0.3).unwrap();
        assert!(estimate_tokens(&out) < estimate_tokens(&text));
        assert!(out.contains("more"));
        assert!(!out.contains('\n'));
    }

    #[test]
    fn json_parse_failure_is_parse_error() {
        let err = compress_json("{not json", 0.5).unwrap_err();
        assert!(matches!(err, CompressionError::Parse(_)));
    }

    #[test]
    fn error_log_dedupes_and_bounds_warnings() {
        let mut log = String::new();
        for _ in 0..3 {
            log.push_str("ERROR db connection refused\n");
        }
        for i in 0..8 {
            log.push_str(&format!("WARN slow query {i}\n"));
        }
        log.push_str("INFO request served\n");
        let out = compress_error_log(&log);
        assert!(out.contains("ERROR db connection refused (×3)"));
        assert_eq!(out.lines().filter(|l| l.starts_with("WARN")).count(), 5);
        assert!(!out.contains("INFO"));
    }

    #[test]
    fn markup_strips_plain_comments_only() {
        let html = "<div>\n  <!-- build note -->\n  <!-- @license MIT -->\n  <p style=\"color : red ; margin: 0 ;\">Hi</p>\n</div>";
        let out = compress_markup(html);
        assert!(!out.contains("build note"));
        assert!(out.contains("@license MIT"));
        assert!(out.contains(r#"style="color:red;margin:0""#));
        assert!(out.starts_with("<div><!--"));
        assert!(out.ends_with("</p></div>"));
    }

    #[test]
    fn markdown_long_sections_become_first_and_last() {
        let body = "First point here. ".to_string()
            + &"Filler sentence goes on. ".repeat(12)
            + "Final point.";
        let doc = format!("# Intro\n{body}\n# Short\nTiny body.");
        let out = compress_markdown(&doc);
        assert!(out.contains("First point here. ... Final point."));
        assert!(out.contains("Tiny body."));
        assert!(out.contains("# Short"));
    }

    #[test]
    fn code_drops_comments() {
        let code = "// helper\nfn a() {}\n\n\n/* block\n comment */\nfn b() {}\n";
        let out = compress_code(code, 0.9, ContentCategory::Rust);
        assert_eq!(out, "fn a() {}\n\nfn b() {}");
    }

    #[test]
    fn file_listing_groups_by_directory() {
        let listing = "src/a.rs\nsrc/b.rs\nsrc/c.rs\nsrc/d.rs\ntests/e.rs\nCargo.toml";
        let out = compress_file_listing(listing, 0.5);
        assert!(out.contains("src/: a.rs, b.rs, +2 more"));
        assert!(out.contains("./: Cargo.toml"));
    }

    #[test]
    fn conversation_long_turns_are_shortened() {
        let long = format!("assistant: Here is the plan. {}", "More detail follows. ".repeat(20));
        let text = format!("user: what now?\n{long}");
        let out = compress_conversation(&text, 0.9);
        assert!(out.contains("assistant: Here is the plan. ..."));
    }
}
