//! Small lexical helpers shared by the offline stages and the heuristic verifier.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:[.,]\d+)*").unwrap_or_else(|e| panic!("invalid number regex: {e}"))
});

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "being", "between", "both", "but", "by", "can", "could", "did", "do", "does",
    "each", "every", "for", "from", "had", "has", "have", "how", "if", "in", "into", "is", "it",
    "its", "least", "may", "more", "most", "must", "no", "not", "of", "on", "once", "only",
    "or", "other", "our", "over", "same", "should", "so", "some", "such", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "those", "through", "to", "under",
    "until", "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who",
    "why", "will", "with", "would", "you", "your",
];

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Lowercased alphanumeric words, in order.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Words that carry meaning: not stopwords, not pure numbers, at least three letters.
pub fn content_words(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() >= 3)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !is_stopword(w))
        .collect()
}

/// Numeric literals in `text`, with thousands separators removed.
pub fn numbers(text: &str) -> BTreeSet<String> {
    NUMBER
        .find_iter(text)
        .map(|m| normalize_number(m.as_str()))
        .collect()
}

fn normalize_number(raw: &str) -> String {
    // "1,000" → "1000"; keep decimal points.
    let no_thousands: String = if raw.contains(',') && !raw.contains('.') {
        raw.replace(',', "")
    } else {
        raw.to_string()
    };
    no_thousands.trim_end_matches('.').to_string()
}

/// Split into sentences on terminal punctuation.
pub fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let s = current.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Top `n` content words by frequency; ties broken alphabetically so the result is
/// deterministic.
pub fn top_terms<'a>(texts: impl IntoIterator<Item = &'a str>, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for w in content_words(text) {
            if w.chars().count() >= 4 {
                *counts.entry(w).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

/// Truncate to at most `max` characters on a char boundary.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}
