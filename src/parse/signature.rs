//! Format signature: identity for the *shape* of an email.
//!
//! Distinct from the alert fingerprint. Two messages share a signature
//! when they come from the same sender domain, with the same normalized
//! subject prefix, and the same set of recognized body markers. The
//! signature clusters novel formats so the LLM is consulted at most
//! once per format.

use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Fixed vocabulary scanned for in the body (lowercase).
const BODY_MARKER_VOCABULARY: &[&str] = &[
    "severity",
    "host:",
    "service",
    "check",
    "critical",
    "warning",
    "resolved",
    "problem",
    "recovery",
    "state:",
    "status:",
    "environment",
    "region",
    "alert",
    "incident",
];

static RE_DIGIT_RUN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\d+").unwrap());

static RE_DATE_TOKEN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2})?)?").unwrap()
});

/// The computed signature tuple plus its hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSignature {
    pub from_domain: String,
    pub subject_prefix: String,
    pub body_markers: Vec<String>,
    /// 64-hex SHA-256 of the tuple.
    pub hash: String,
}

/// Normalize a subject into its format prefix: date-like tokens become
/// `*DATE*`, remaining digit runs become `*N*`, and the result is
/// truncated to a stable prefix length.
pub fn normalize_subject_prefix(subject: &str) -> String {
    let lowered = subject.trim().to_lowercase();
    let dated = RE_DATE_TOKEN.replace_all(&lowered, "*DATE*");
    let numbered = RE_DIGIT_RUN.replace_all(&dated, "*N*");
    numbered.chars().take(64).collect()
}

/// The sender's domain part, lowercased; empty when the address is
/// malformed.
pub fn from_domain(from_addr: &str) -> String {
    match from_addr.rsplit_once('@') {
        Some((_, domain)) => domain.trim_end_matches('>').trim().to_lowercase(),
        None => String::new(),
    }
}

/// Subset of the fixed vocabulary present in the body, sorted.
pub fn body_markers(body: &str) -> Vec<String> {
    let lowered = body.to_lowercase();
    let mut markers: Vec<String> = BODY_MARKER_VOCABULARY
        .iter()
        .filter(|marker| lowered.contains(*marker))
        .map(|marker| marker.to_string())
        .collect();
    markers.sort();
    markers
}

/// Compute the full signature for a message.
pub fn compute(from_addr: &str, subject: &str, body: &str) -> FormatSignature {
    let from_domain = from_domain(from_addr);
    let subject_prefix = normalize_subject_prefix(subject);
    let markers = body_markers(body);

    let mut hasher = Sha256::new();
    hasher.update(from_domain.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(subject_prefix.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(markers.join(",").as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    FormatSignature {
        from_domain,
        subject_prefix,
        body_markers: markers,
        hash,
    }
}
