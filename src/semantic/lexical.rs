//! Keyword similarity between vocabulary labels.
//!
//! Labels are reduced to sets of normalized terms and compared with the
//! Jaccard index. This path needs no trained state and is always available,
//! so it is the baseline every pair gets scored with.

use std::collections::BTreeSet;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
    "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
    "and", "or", "but", "not", "no", "so", "if", "then", "due", "into",
];

/// Tokenize text into lowercase, lightly stemmed terms.
/// Filters out very short terms (1 char) and common stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .map(|s| stem(&s))
        .collect()
}

/// Distinct terms of a label, in sorted order.
pub fn term_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard index of two term sets, 0.0 when both are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Keyword similarity of two labels in [0, 1]; symmetric.
pub fn keyword_similarity(a: &str, b: &str) -> f32 {
    jaccard(&term_set(a), &term_set(b))
}

/// Plural folding so that "discharges" and "discharge" share a term.
fn stem(term: &str) -> String {
    if term.len() > 4 && term.ends_with("ies") {
        return format!("{}y", &term[..term.len() - 3]);
    }
    if term.len() > 3 && term.ends_with('s') && !term.ends_with("ss") && !term.ends_with("us") {
        return term[..term.len() - 1].to_string();
    }
    term.to_string()
}
