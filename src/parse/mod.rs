//! Normalization pipeline: rules, then learned patterns, then the LLM.
//!
//! A raw email passes through up to three extraction stages. Static
//! regex rules claim known formats outright; the pattern cache replays
//! rule sets the LLM proposed for previously seen format signatures;
//! genuinely novel formats go to the LLM once per signature, behind the
//! idempotency store. Anything that fails validation or confidence
//! checks lands in quarantine. Maintenance announcements short-circuit
//! into the maintenance engine before alert extraction.

pub mod llm;
pub mod rules;
pub mod signature;

use crate::config::{LlmConfig, MaintenanceConfig, ParserConfig};
use crate::fingerprint;
use crate::maintenance::detect::{self, DetectError};
use crate::maintenance::MaintenanceEngine;
use crate::models::{AlertState, ExtractionType, MaintenanceWindow, ParseStatus, RawEmail, Severity};
use crate::store::events::NewAlertEvent;
use crate::store::{Begin, IdempotencyStore, PatternCacheStore, QuarantineStore, RawEmailStore};
use llm::{AlertExtractor, LlmError, LlmExtraction};
use rules::{Extraction, RuleSet};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Terminal result of parsing one raw email.
#[derive(Debug)]
pub enum ParseDisposition {
    /// A normalized alert, ready for maintenance matching and
    /// correlation. Not yet inserted.
    Alert(Box<NewAlertEvent>, ExtractionType),
    /// The message declared a maintenance window, now stored.
    Maintenance(Box<MaintenanceWindow>),
    /// Extraction failed validation or confidence; held for review.
    Quarantined { reason: String },
    /// Malformed announcement or similar data error; recorded on the
    /// raw email.
    Failed { reason: String },
    /// The email was already parsed (idempotent reprocess).
    AlreadyParsed,
}

/// Errors that abort parsing. `Transient` is retryable and routes to
/// the dead-letter queue; everything else already reached a terminal
/// disposition.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("raw email {0} not found")]
    MissingEmail(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct Parser {
    rules: RuleSet,
    config: ParserConfig,
    llm_config: LlmConfig,
    maintenance_config: MaintenanceConfig,
    raw_emails: RawEmailStore,
    cache: PatternCacheStore,
    quarantine: QuarantineStore,
    idempotency: IdempotencyStore,
    maintenance: Arc<MaintenanceEngine>,
    extractor: Arc<dyn AlertExtractor>,
}

impl Parser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: RuleSet,
        config: ParserConfig,
        llm_config: LlmConfig,
        maintenance_config: MaintenanceConfig,
        raw_emails: RawEmailStore,
        cache: PatternCacheStore,
        quarantine: QuarantineStore,
        idempotency: IdempotencyStore,
        maintenance: Arc<MaintenanceEngine>,
        extractor: Arc<dyn AlertExtractor>,
    ) -> Self {
        Self {
            rules,
            config,
            llm_config,
            maintenance_config,
            raw_emails,
            cache,
            quarantine,
            idempotency,
            maintenance,
            extractor,
        }
    }

    /// Parse one stored email through the full pipeline.
    pub async fn process(&self, raw_email_id: Uuid) -> Result<ParseDisposition, ParseError> {
        let raw = self
            .raw_emails
            .get(raw_email_id)
            .await?
            .ok_or(ParseError::MissingEmail(raw_email_id))?;

        // Deterministic rule application makes reprocessing a no-op.
        if raw.parse_status == ParseStatus::Parsed {
            return Ok(ParseDisposition::AlreadyParsed);
        }

        // Maintenance detection runs before alert extraction; an
        // announcement is not an alert.
        match detect::detect(
            &raw.subject,
            &raw.body_text,
            raw.ics_payload.as_deref(),
            &raw.from_addr,
            &self.maintenance_config.subject_prefixes,
        ) {
            Ok(candidate) => {
                let window = self.maintenance.upsert_candidate(&candidate).await?;
                self.raw_emails
                    .set_parse_status(raw.id, ParseStatus::Parsed, None)
                    .await?;
                return Ok(ParseDisposition::Maintenance(Box::new(window)));
            }
            Err(DetectError::NotAnAnnouncement) => {}
            Err(e) => {
                let reason = e.to_string();
                self.raw_emails
                    .set_parse_status(raw.id, ParseStatus::Failed, Some(&reason))
                    .await?;
                return Ok(ParseDisposition::Failed { reason });
            }
        }

        // Stage 1: static rules.
        if let Some((rule, extraction)) =
            self.rules
                .try_extract(&raw.subject, &raw.from_addr, &raw.body_text)
        {
            let severity = rule.map_severity(&extraction.severity_token);
            let state = rule.map_state(&extraction.state_token);
            let tags = rules::collect_tags(&rule.static_tags, &raw.body_text);
            let event = self.build_event(&raw, &rule.name, &extraction, severity, state, tags);

            self.cache
                .log_extraction(
                    Some(raw.id),
                    None,
                    ExtractionType::Rule,
                    Some(&rule.name),
                    None,
                    true,
                    None,
                )
                .await?;
            return Ok(ParseDisposition::Alert(Box::new(event), ExtractionType::Rule));
        }

        // Stage 2: learned-pattern cache, keyed by format signature.
        let sig = signature::compute(&raw.from_addr, &raw.subject, &raw.body_text);

        if let Some(entry) = self.cache.lookup(&sig.hash).await? {
            if entry.success_rate >= self.config.cache_min_success {
                match self.apply_cached(&raw, &entry.extraction_rules, &entry.source_name) {
                    Some(event) => {
                        self.cache.record_hit(&sig.hash).await?;
                        self.cache
                            .log_extraction(
                                Some(raw.id),
                                Some(&sig.hash),
                                ExtractionType::Cached,
                                Some(&entry.source_name),
                                None,
                                true,
                                None,
                            )
                            .await?;
                        return Ok(ParseDisposition::Alert(
                            Box::new(event),
                            ExtractionType::Cached,
                        ));
                    }
                    None => {
                        // The cached rules no longer extract a valid
                        // alert from this format; damp the pattern and
                        // fall through to the LLM.
                        self.cache.record_failure(&sig.hash).await?;
                        self.cache
                            .log_extraction(
                                Some(raw.id),
                                Some(&sig.hash),
                                ExtractionType::Cached,
                                Some(&entry.source_name),
                                None,
                                false,
                                Some("cached rules produced no valid extraction"),
                            )
                            .await?;
                    }
                }
            }
        }

        // Stage 3: LLM fallback, at most once per signature.
        self.llm_stage(&raw, &sig).await
    }

    /// Apply a cached/learned rule document; `None` when the result is
    /// not a usable alert (missing host).
    fn apply_cached(
        &self,
        raw: &RawEmail,
        extraction_rules: &Value,
        source_name: &str,
    ) -> Option<NewAlertEvent> {
        let fields =
            rules::apply_rule_document(extraction_rules, &raw.subject, &raw.body_text).ok()?;

        let host = fields.get("host").cloned().unwrap_or_default();
        if host.trim().is_empty() {
            return None;
        }

        let severity_token = fields.get("severity").cloned().unwrap_or_default();
        let state_token = fields.get("state").cloned().unwrap_or_default();
        let extraction = Extraction {
            host,
            service: fields.get("service").cloned().unwrap_or_default(),
            check_name: fields.get("check").cloned().unwrap_or_default(),
            environment: fields.get("environment").cloned().unwrap_or_default(),
            region: fields.get("region").cloned().unwrap_or_default(),
            severity_token: severity_token.clone(),
            state_token: state_token.clone(),
        };

        let severity = Severity::from_token(&severity_token).unwrap_or(Severity::Medium);
        let state = AlertState::from_token(&state_token).unwrap_or(AlertState::Unknown);
        let source_tool = if source_name.is_empty() {
            signature::from_domain(&raw.from_addr)
        } else {
            source_name.to_string()
        };
        let tags = rules::collect_tags(&[], &raw.body_text);

        Some(self.build_event(raw, &source_tool, &extraction, severity, state, tags))
    }

    async fn llm_stage(
        &self,
        raw: &RawEmail,
        sig: &signature::FormatSignature,
    ) -> Result<ParseDisposition, ParseError> {
        let excerpt = llm::body_excerpt(&raw.body_text, self.llm_config.body_excerpt_bytes);
        let idem_key = format!("llm:{}", sig.hash);

        let extraction: LlmExtraction = match self.idempotency.begin(&idem_key).await? {
            Begin::Completed(Some(stored)) => serde_json::from_value(stored)
                .map_err(|e| ParseError::Transient(format!("stored llm result unreadable: {e}")))?,
            Begin::Completed(None) => {
                return Err(ParseError::Transient(
                    "llm idempotency key completed without result".to_string(),
                ));
            }
            Begin::InProgress => {
                return Err(ParseError::Transient(
                    "llm extraction already in flight for this signature".to_string(),
                ));
            }
            Begin::Fresh => {
                match self.extractor.extract(&raw.subject, excerpt).await {
                    Ok(extraction) => {
                        let stored = serde_json::json!({
                            "fields": extraction.fields,
                            "confidence": extraction.confidence,
                            "rules": extraction.rules,
                        });
                        self.idempotency.complete(&idem_key, Some(stored)).await?;
                        extraction
                    }
                    Err(LlmError::Decode(e)) => {
                        // Not the requested schema: a data error.
                        return self
                            .quarantine_email(
                                raw,
                                sig,
                                Value::Null,
                                0.0,
                                &format!("llm response malformed: {e}"),
                            )
                            .await;
                    }
                    Err(e) => return Err(ParseError::Transient(e.to_string())),
                }
            }
        };

        let validated = match llm::validate_extraction(&extraction, &raw.subject, excerpt) {
            Ok(validated) => validated,
            Err(e) => {
                self.cache
                    .log_extraction(
                        Some(raw.id),
                        Some(&sig.hash),
                        ExtractionType::LlmFallback,
                        None,
                        Some(extraction.confidence),
                        false,
                        Some(&e.to_string()),
                    )
                    .await?;
                let candidate = serde_json::to_value(&extraction.fields).unwrap_or(Value::Null);
                return self
                    .quarantine_email(raw, sig, candidate, extraction.confidence, &e.to_string())
                    .await;
            }
        };

        if validated.confidence < self.config.quarantine_confidence_threshold {
            self.cache
                .log_extraction(
                    Some(raw.id),
                    Some(&sig.hash),
                    ExtractionType::LlmFallback,
                    None,
                    Some(validated.confidence),
                    false,
                    Some("confidence below threshold"),
                )
                .await?;
            let candidate = serde_json::to_value(&extraction.fields).unwrap_or(Value::Null);
            return self
                .quarantine_email(
                    raw,
                    sig,
                    candidate,
                    validated.confidence,
                    "confidence below threshold",
                )
                .await;
        }

        // Learn the format: store the proposed rules under the
        // signature so the next email of this shape skips the LLM.
        if validated.rules.is_object() && validated.confidence >= self.llm_config.min_confidence {
            self.cache
                .insert_learned(
                    &sig.hash,
                    &sig.from_domain,
                    &sig.subject_prefix,
                    &sig.body_markers,
                    &sig.from_domain,
                    &validated.rules,
                    Some(raw.id),
                )
                .await?;
        }
        self.cache
            .log_extraction(
                Some(raw.id),
                Some(&sig.hash),
                ExtractionType::LearnedNew,
                None,
                Some(validated.confidence),
                true,
                None,
            )
            .await?;

        let extraction = Extraction {
            host: validated.host.clone(),
            service: validated.service.clone(),
            check_name: String::new(),
            environment: String::new(),
            region: String::new(),
            severity_token: extraction.fields.severity.clone(),
            state_token: extraction.fields.state.clone(),
        };
        let source_tool = if sig.from_domain.is_empty() {
            "llm".to_string()
        } else {
            sig.from_domain.clone()
        };
        let tags = rules::collect_tags(&[], &raw.body_text);
        let event = self.build_event(
            raw,
            &source_tool,
            &extraction,
            validated.severity,
            validated.state,
            tags,
        );

        Ok(ParseDisposition::Alert(
            Box::new(event),
            ExtractionType::LlmFallback,
        ))
    }

    async fn quarantine_email(
        &self,
        raw: &RawEmail,
        sig: &signature::FormatSignature,
        candidate: Value,
        confidence: f64,
        reason: &str,
    ) -> Result<ParseDisposition, ParseError> {
        self.quarantine
            .push(raw.id, Some(&sig.hash), candidate, confidence, reason)
            .await?;
        self.raw_emails
            .set_parse_status(raw.id, ParseStatus::Quarantined, Some(reason))
            .await?;

        Ok(ParseDisposition::Quarantined {
            reason: reason.to_string(),
        })
    }

    fn build_event(
        &self,
        raw: &RawEmail,
        source_tool: &str,
        extraction: &Extraction,
        severity: Severity,
        state: AlertState,
        tags: Vec<String>,
    ) -> NewAlertEvent {
        let host = rules::normalize_host(&extraction.host);
        let service = extraction.service.trim().to_lowercase();
        let check_name = extraction.check_name.trim().to_lowercase();
        let environment = extraction.environment.trim().to_lowercase();
        let region = extraction.region.trim().to_lowercase();

        let normalized_signature = rules::normalized_signature(
            &raw.subject,
            &[
                extraction.severity_token.as_str(),
                extraction.state_token.as_str(),
            ],
        );
        let fp = fingerprint::fingerprint_v2(
            source_tool,
            &environment,
            &host,
            &check_name,
            &service,
            &normalized_signature,
        );
        let content_hash = fingerprint::content_hash(&fp, severity, state, &normalized_signature);

        let payload = serde_json::json!({
            "subject": raw.subject,
            "severity_token": extraction.severity_token,
            "state_token": extraction.state_token,
        });

        NewAlertEvent {
            raw_email_id: Some(raw.id),
            source_tool: source_tool.to_string(),
            environment,
            region,
            host,
            check_name,
            service,
            severity,
            state,
            occurred_at: raw.date_header.unwrap_or(raw.received_at),
            normalized_signature,
            fingerprint: fp,
            content_hash,
            payload,
            tags,
            is_suppressed: false,
            suppression_reason: None,
        }
    }
}
