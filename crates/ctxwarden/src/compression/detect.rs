//! Content-type detection by weighted pattern density.
//!
//! Each category owns a handful of `(pattern, weight)` pairs. A category's
//! score is the sum of `weight × share-of-lines-matching`; the best score
//! wins, and anything scoring under [`MIN_CONFIDENCE`] is plain text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Below this score the text is treated as plain prose.
pub const MIN_CONFIDENCE: f64 = 0.1;

/// Bonus when the whole text parses as JSON.
const JSON_PARSE_BONUS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentCategory {
    JavaScript,
    TypeScript,
    Python,
    Rust,
    Html,
    Json,
    Xml,
    ErrorLog,
    ConversationLog,
    Markdown,
    FileListing,
    PlainText,
}

impl ContentCategory {
    pub fn label(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Python => "python",
            Self::Rust => "rust",
            Self::Html => "html",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::ErrorLog => "error-log",
            Self::ConversationLog => "conversation-log",
            Self::Markdown => "markdown",
            Self::FileListing => "file-listing",
            Self::PlainText => "plain-text",
        }
    }

    pub fn is_code(self) -> bool {
        matches!(
            self,
            Self::JavaScript | Self::TypeScript | Self::Python | Self::Rust
        )
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Winning category and its score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub category: ContentCategory,
    pub confidence: f64,
}

struct Rule {
    category: ContentCategory,
    patterns: Vec<(Regex, f64)>,
}

fn rule(category: ContentCategory, patterns: &[(&str, f64)]) -> Rule {
    Rule {
        category,
        patterns: patterns
            .iter()
            .map(|(p, w)| (Regex::new(p).expect("valid regex literal"), *w))
            .collect(),
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    use ContentCategory::*;
    vec![
        rule(JavaScript, &[
            (r"\b(?:function|const|let|var)\s+\w+", 0.4),
            (r"=>", 0.3),
            (r"\bconsole\.\w+\(", 0.4),
            (r"\brequire\(|\bmodule\.exports\b", 0.4),
            (r";\s*$", 0.1),
        ]),
        rule(TypeScript, &[
            (r":\s*(?:string|number|boolean|any|void|unknown)\b", 0.6),
            (r"\binterface\s+\w+\s*\{", 0.6),
            (r"\btype\s+\w+\s*=", 0.5),
            (r"\b(?:const|let)\s+\w+\s*:", 0.4),
            (r"=>", 0.2),
        ]),
        rule(Python, &[
            (r"^\s*def\s+\w+\s*\(", 0.6),
            (r"^\s*(?:from\s+[\w.]+\s+)?import\s+\w+", 0.4),
            (r"^\s*class\s+\w+.*:\s*$", 0.5),
            (r"\bself\.", 0.4),
            (r"^\s*(?:if|for|while|elif|else|try|except|with)\b.*:\s*$", 0.3),
        ]),
        rule(Rust, &[
            (r"\bfn\s+\w+", 0.5),
            (r"\blet\s+mut\b", 0.5),
            (r"^\s*impl\b", 0.5),
            (r"\bpub\s+(?:fn|struct|enum|mod|trait)\b", 0.5),
            (r"\w::\w", 0.2),
            (r"^\s*#\[", 0.4),
        ]),
        rule(Html, &[
            (r"(?i)<(?:html|head|body|div|span|p|a|ul|li|script|style|section|!doctype)\b", 0.6),
            (r"</\w+>", 0.3),
            (r"<!--", 0.2),
        ]),
        rule(Json, &[
            (r#"^\s*"[^"]+"\s*:"#, 0.6),
            (r"^\s*[\[{]\s*$", 0.2),
            (r"^\s*[\]}],?\s*$", 0.2),
        ]),
        rule(Xml, &[
            (r"<\?xml", 1.0),
            (r"<\w+:\w+", 0.4),
            (r"/>", 0.2),
            (r"</\w+>", 0.2),
        ]),
        rule(ErrorLog, &[
            (r"\b(?:ERROR|FATAL|CRITICAL)\b", 0.7),
            (r"\bWARN(?:ING)?\b", 0.4),
            (r"^\s+at\s+\S+", 0.4),
            (r"Traceback|Exception|panicked at|Caused by:", 0.4),
            (r"^\[?\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}", 0.3),
        ]),
        rule(ConversationLog, &[
            (r"(?i)^\s*(?:user|assistant|human|ai|system|bot)\s*:", 0.9),
            (r"^\s*>\s", 0.1),
        ]),
        rule(Markdown, &[
            (r"^#{1,6}\s+\S", 0.6),
            (r"^\s*[-*+]\s+\S", 0.2),
            (r"^```", 0.3),
            (r"\[[^\]]+\]\([^)]+\)", 0.3),
            (r"\*\*[^*]+\*\*", 0.2),
        ]),
        rule(FileListing, &[
            (r"^\s*(?:[├└│─ ]+)?[\w.@-]+(?:/[\w.@-]+)*\.\w{1,6}\s*$", 0.7),
            (r"^\s*(?:[├└│─ ]+)?[\w.@-]+(?:/[\w.@-]+)*/\s*$", 0.5),
            (r"^[├└│]", 0.3),
        ]),
    ]
});

/// Detect the category of `text`.
pub fn detect_content(text: &str) -> Detection {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return Detection {
            category: ContentCategory::PlainText,
            confidence: 0.0,
        };
    }
    let total = lines.len() as f64;

    let mut best = (ContentCategory::PlainText, 0.0);
    for rule in RULES.iter() {
        let mut score: f64 = rule
            .patterns
            .iter()
            .map(|(re, weight)| {
                let hits = lines.iter().filter(|l| re.is_match(l)).count();
                weight * hits as f64 / total
            })
            .sum();
        if rule.category == ContentCategory::Json && parses_as_json(text) {
            score += JSON_PARSE_BONUS;
        }
        tracing::trace!("[compress] detect {}: {score:.3}", rule.category);
        if score > best.1 {
            best = (rule.category, score);
        }
    }

    if best.1 < MIN_CONFIDENCE {
        return Detection {
            category: ContentCategory::PlainText,
            confidence: best.1,
        };
    }
    Detection {
        category: best.0,
        confidence: best.1,
    }
}

fn parses_as_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(text).is_ok()
}
