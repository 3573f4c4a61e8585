//! Stable identity for "the same alert" across time.
//!
//! The fingerprint is derived exclusively from fields that describe what
//! the alert is about. Severity and transient state never participate,
//! so escalations and firing/resolved pairs map to the same incident.

use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static RE_UUID: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static RE_TIMESTAMP: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(:\d{2})?(\.\d+)?(Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});

static RE_IP: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b\d{1,3}(\.\d{1,3}){3}\b").unwrap());

static RE_DIGITS: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\d+").unwrap());

/// Canonical host form: lowercase, trailing dot stripped. Numeric
/// suffixes after the last `-` are preserved so `web-01` and `web-02`
/// stay distinct hosts.
pub fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// Canonical check/service form: the first non-empty of check-name or
/// service, lowercased, with digit runs collapsed so per-run correlation
/// ids do not split incidents.
pub fn canonical_check_or_service(check_name: &str, service: &str) -> String {
    let picked = if check_name.trim().is_empty() {
        service
    } else {
        check_name
    };
    RE_DIGITS
        .replace_all(&picked.trim().to_lowercase(), "*")
        .into_owned()
}

/// Replace volatile tokens (UUIDs, timestamps, IP addresses, digit runs)
/// in a human-readable signature with placeholders.
pub fn scrub_signature(signature: &str) -> String {
    let s = RE_UUID.replace_all(signature, "<uuid>");
    let s = RE_TIMESTAMP.replace_all(&s, "<ts>");
    let s = RE_IP.replace_all(&s, "<ip>");
    RE_DIGITS.replace_all(&s, "#").into_owned()
}

fn signature_prefix(signature: &str) -> String {
    scrub_signature(signature).chars().take(80).collect()
}

/// Compute the v2 fingerprint: lowercase hex SHA-256 of the identity
/// tuple, truncated to 32 characters.
pub fn fingerprint_v2(
    source_tool: &str,
    environment: &str,
    host: &str,
    check_name: &str,
    service: &str,
    normalized_signature: &str,
) -> String {
    let tuple = [
        source_tool.trim().to_lowercase(),
        environment.trim().to_lowercase(),
        canonical_host(host),
        canonical_check_or_service(check_name, service),
        signature_prefix(normalized_signature),
    ]
    .join("\x1f");

    let digest = Sha256::digest(tuple.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..32].to_string()
}

/// Content hash for repeat-occurrence detection: unlike the fingerprint
/// it does include severity and state, so only verbatim repeats dedup.
pub fn content_hash(
    fingerprint: &str,
    severity: crate::models::Severity,
    state: crate::models::AlertState,
    normalized_signature: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(severity.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(state.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(normalized_signature.as_bytes());
    format!("{:x}", hasher.finalize())
}
