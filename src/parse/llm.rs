//! Language-model extraction client.
//!
//! The LLM is an unreliable external collaborator: every response is
//! schema-validated and self-consistency-checked against the source
//! text before anything is stored, and proposed regexes must compile
//! and actually reproduce the returned field values. Requests are
//! bounded by a mandatory timeout, a requests-per-minute bucket, and a
//! concurrency cap.

use crate::config::LlmConfig;
use crate::models::{AlertState, Severity};
use crate::parse::rules::apply_rule_document;
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors from the LLM call path. Any of these routes the email to
/// quarantine rather than retry.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm endpoint returned status {status}: {body}")]
    Service { status: StatusCode, body: String },
    #[error("llm response is not the requested schema: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("llm concurrency slot unavailable")]
    Capacity,
}

/// The field block the schema requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmFields {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub state: String,
}

/// A complete extraction response.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmExtraction {
    pub fields: LlmFields,
    pub confidence: f64,
    /// Proposed extraction rules, `field -> {source, regex, group?, map?}`.
    #[serde(default)]
    pub rules: Value,
}

/// Seam for the extraction capability so tests can script responses.
#[rocket::async_trait]
pub trait AlertExtractor: Send + Sync {
    async fn extract(&self, subject: &str, body_excerpt: &str) -> Result<LlmExtraction, LlmError>;
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    model: &'a str,
    subject: &'a str,
    body: &'a str,
    schema: Value,
}

/// HTTP-backed extractor.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    limiter: governor::DefaultDirectRateLimiter,
    slots: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("ngs-parser/0.1")
            .build()
            .map_err(LlmError::Http)?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(rpm));
        let slots = Arc::new(Semaphore::new(config.max_in_flight.max(1)));

        Ok(Self {
            http,
            config,
            limiter,
            slots,
        })
    }

    fn request_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["fields", "confidence"],
            "properties": {
                "fields": {
                    "type": "object",
                    "required": ["host", "severity", "state"],
                    "properties": {
                        "host": {"type": "string"},
                        "service": {"type": "string"},
                        "severity": {"enum": ["info", "low", "medium", "high", "critical"]},
                        "state": {"enum": ["firing", "resolved", "unknown"]}
                    }
                },
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "rules": {"type": "object"}
            }
        })
    }
}

#[rocket::async_trait]
impl AlertExtractor for LlmClient {
    async fn extract(&self, subject: &str, body_excerpt: &str) -> Result<LlmExtraction, LlmError> {
        // Surplus work blocks here: first on the in-flight cap, then on
        // the per-minute bucket.
        let _slot = self.slots.acquire().await.map_err(|_| LlmError::Capacity)?;
        self.limiter.until_ready().await;

        let payload = ExtractRequest {
            model: &self.config.model,
            subject,
            body: body_excerpt,
            schema: Self::request_schema(),
        };

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(LlmError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Service { status, body });
        }

        let bytes = response.bytes().await.map_err(LlmError::Http)?;
        let extraction: LlmExtraction = serde_json::from_slice(&bytes)?;
        Ok(extraction)
    }
}

/// Truncate a body to at most `max_bytes`, never splitting a UTF-8
/// scalar.
pub fn body_excerpt(body: &str, max_bytes: usize) -> &str {
    if body.len() <= max_bytes {
        return body;
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Why a response was rejected; recorded as the quarantine reason.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("severity `{0}` is not a recognized level")]
    BadSeverity(String),
    #[error("state `{0}` is not a recognized state")]
    BadState(String),
    #[error("host is empty")]
    EmptyHost,
    #[error("confidence {0} is outside [0, 1]")]
    BadConfidence(f64),
    #[error("proposed rules are invalid: {0}")]
    BadRules(String),
    #[error("rule for `{field}` produced `{produced}` but the response claims `{claimed}`")]
    Inconsistent {
        field: String,
        produced: String,
        claimed: String,
    },
}

/// A response that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedExtraction {
    pub host: String,
    pub service: String,
    pub severity: Severity,
    pub state: AlertState,
    pub confidence: f64,
    pub rules: Value,
}

/// Schema-validate and self-consistency-check an LLM response against
/// the original text. The confidence threshold is checked by the
/// caller; this function only establishes that the response is
/// well-formed and honest.
pub fn validate_extraction(
    extraction: &LlmExtraction,
    subject: &str,
    body: &str,
) -> Result<ValidatedExtraction, ValidationError> {
    let severity = Severity::from_token(&extraction.fields.severity)
        .ok_or_else(|| ValidationError::BadSeverity(extraction.fields.severity.clone()))?;
    let state = AlertState::from_token(&extraction.fields.state)
        .ok_or_else(|| ValidationError::BadState(extraction.fields.state.clone()))?;

    let host = extraction.fields.host.trim();
    if host.is_empty() {
        return Err(ValidationError::EmptyHost);
    }
    if !(0.0..=1.0).contains(&extraction.confidence) {
        return Err(ValidationError::BadConfidence(extraction.confidence));
    }

    // Compile and re-apply every proposed rule; the rules must
    // reproduce the values the response claims.
    if !extraction.rules.is_null() {
        let produced = apply_rule_document(&extraction.rules, subject, body)
            .map_err(|e| ValidationError::BadRules(e.to_string()))?;

        for (field, claimed) in [
            ("host", extraction.fields.host.as_str()),
            ("service", extraction.fields.service.as_str()),
            ("severity", extraction.fields.severity.as_str()),
            ("state", extraction.fields.state.as_str()),
        ] {
            if claimed.is_empty() {
                continue;
            }
            if let Some(value) = produced.get(field) {
                if !value.eq_ignore_ascii_case(claimed) {
                    return Err(ValidationError::Inconsistent {
                        field: field.to_string(),
                        produced: value.clone(),
                        claimed: claimed.to_string(),
                    });
                }
            }
        }
    }

    Ok(ValidatedExtraction {
        host: crate::parse::rules::normalize_host(host),
        service: extraction.fields.service.trim().to_lowercase(),
        severity,
        state,
        confidence: extraction.confidence,
        rules: extraction.rules.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rules: Value) -> LlmExtraction {
        LlmExtraction {
            fields: LlmFields {
                host: "web-01".to_string(),
                service: "http".to_string(),
                severity: "critical".to_string(),
                state: "firing".to_string(),
            },
            confidence: 0.9,
            rules,
        }
    }

    #[test]
    fn consistent_response_validates() {
        let rules = serde_json::json!({
            "host": {"source": "body", "regex": r"node (\S+) is"}
        });
        let validated =
            validate_extraction(&sample(rules), "outage", "node web-01 is down").unwrap();
        assert_eq!(validated.host, "web-01");
        assert_eq!(validated.severity, Severity::Critical);
    }

    #[test]
    fn inconsistent_rule_is_rejected() {
        let rules = serde_json::json!({
            "host": {"source": "body", "regex": r"node (\S+) is"}
        });
        let err =
            validate_extraction(&sample(rules), "outage", "node db-99 is down").unwrap_err();
        assert!(matches!(err, ValidationError::Inconsistent { .. }));
    }

    #[test]
    fn bad_regex_is_rejected() {
        let rules = serde_json::json!({"host": {"source": "body", "regex": "("}});
        let err = validate_extraction(&sample(rules), "s", "b").unwrap_err();
        assert!(matches!(err, ValidationError::BadRules(_)));
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut extraction = sample(Value::Null);
        extraction.confidence = 1.5;
        let err = validate_extraction(&extraction, "s", "b").unwrap_err();
        assert_eq!(err, ValidationError::BadConfidence(1.5));
    }

    #[test]
    fn unknown_severity_is_rejected() {
        let mut extraction = sample(Value::Null);
        extraction.fields.severity = "purple".to_string();
        assert!(matches!(
            validate_extraction(&extraction, "s", "b"),
            Err(ValidationError::BadSeverity(_))
        ));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let body = "héllo wörld";
        let excerpt = body_excerpt(body, 2);
        assert_eq!(excerpt, "h");
        assert!(body_excerpt(body, 1024).len() == body.len());
    }
}
