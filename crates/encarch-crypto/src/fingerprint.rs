//! Fingerprint suffix validation and matching

use std::sync::OnceLock;

use regex_lite::Regex;

fn suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{8,40}$").expect("static pattern"))
}

/// Check that `suffix` looks like the tail of a key fingerprint.
pub fn is_valid_suffix(suffix: &str) -> bool {
    suffix_pattern().is_match(suffix)
}

/// Check whether `fingerprint` ends with `suffix`, ignoring case.
pub fn matches_suffix(fingerprint: &str, suffix: &str) -> bool {
    if suffix.is_empty() || suffix.len() > fingerprint.len() {
        return false;
    }
    fingerprint
        .get(fingerprint.len() - suffix.len()..)
        .map_or(false, |tail| tail.eq_ignore_ascii_case(suffix))
}
