//! Text normalization, content fingerprinting, and pacing utilities.
//!
//! Everything that decides whether two pieces of content are "the same" for
//! duplicate suppression lives here, so discovery, engagement, and auto-post
//! agree on the definition.

use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Lowercase, trim, and collapse internal whitespace runs to single spaces.
pub fn normalize_text(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse whitespace runs without changing case.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content fingerprint: sha256 hex digest of the normalized text.
pub fn fingerprint_text(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(input).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Case- and whitespace-normalized substring match against an exclusion list.
pub fn contains_excluded_words(input: &str, excluded_words: &[String]) -> bool {
    let normalized = normalize_text(input);
    excluded_words
        .iter()
        .any(|word| !word.trim().is_empty() && normalized.contains(&normalize_text(word)))
}

static SPAM_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["free\\s+money", "guaranteed", "dm\\s+me\\s+now", "100%"]
        .iter()
        .map(|pattern| Regex::new(&format!("(?i){pattern}")).expect("static spam pattern"))
        .collect()
});

/// Rule-based spam heuristic applied before any provider moderation call.
pub fn is_likely_spam(input: &str) -> bool {
    if normalize_text(input).len() < 10 {
        return true;
    }
    SPAM_PATTERNS.iter().any(|pattern| pattern.is_match(input))
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

/// Uniform random delay in milliseconds within `[min_ms, max_ms]`.
pub fn random_jitter_ms(min_ms: u64, max_ms: u64) -> u64 {
    if min_ms >= max_ms {
        return min_ms;
    }
    rand::thread_rng().gen_range(min_ms..=max_ms)
}
