//! Shared utility functions used across multiple modules.

use regex::Regex;
use std::sync::OnceLock;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check that a record kind is a lowercase identifier such as `patient`.
pub fn is_valid_kind(kind: &str) -> bool {
    static KIND_PATTERN: OnceLock<Regex> = OnceLock::new();
    KIND_PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("Invalid regex"))
        .is_match(kind)
}
