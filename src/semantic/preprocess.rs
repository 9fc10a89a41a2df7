//! Label preprocessing shared by the keyword and embedding paths.
//!
//! 1. Trim and collapse internal whitespace
//! 2. Truncate to a maximum length with ellipsis

/// Maximum label length fed to the similarity paths (characters)
const MAX_LABEL_LENGTH: usize = 256;

/// Ellipsis suffix when a label is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Normalize whitespace and bound the length of a vocabulary label.
///
/// Returns `None` for labels that are empty after trimming.
pub fn preprocess_label(label: &str) -> Option<String> {
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_label(&collapsed))
}

/// Number of whitespace-separated words in a label.
pub fn word_count(label: &str) -> usize {
    label.split_whitespace().count()
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_LENGTH {
        return label.to_string();
    }

    let max_chars = MAX_LABEL_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = label.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}
