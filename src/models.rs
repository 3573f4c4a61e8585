//! Core records and enums shared across the pipeline.
//!
//! Every struct that crosses the HTTP boundary derives `JsonSchema` so
//! `rocket_okapi` can describe the payloads in the generated OpenAPI
//! document. Enums are stored in Postgres as stable string names via
//! `sqlx::Type`.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Parse lifecycle of a stored raw email. Advances monotonically from
/// `pending` to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "parse_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Pending,
    Parsed,
    Failed,
    Quarantined,
}

/// Normalized alert severity. Variant order defines the escalation
/// ordering used by `severity_max` (and matches the Postgres enum order,
/// so `GREATEST` agrees with `Ord`).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    sqlx::Type,
)]
#[sqlx(type_name = "severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parse a severity token leniently. Callers map unknown tokens to
    /// `Medium` per the normalization contract.
    pub fn from_token(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "informational" | "ok" => Some(Self::Info),
            "low" | "notice" | "p4" | "p5" => Some(Self::Low),
            "medium" | "warning" | "warn" | "minor" | "p3" => Some(Self::Medium),
            "high" | "major" | "error" | "err" | "p2" => Some(Self::High),
            "critical" | "crit" | "fatal" | "disaster" | "red" | "p1" => Some(Self::Critical),
            _ => None,
        }
    }

    /// The next step down, used by maintenance `downgrade` mode.
    pub fn downgraded(self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Medium,
            Self::Medium => Self::Low,
            Self::Low | Self::Info => Self::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Observed state of an alert occurrence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, sqlx::Type,
)]
#[sqlx(type_name = "alert_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Firing,
    Resolved,
    Unknown,
}

impl AlertState {
    pub fn from_token(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "firing" | "problem" | "alert" | "triggered" | "down" | "open" => Some(Self::Firing),
            "resolved" | "recovery" | "recovered" | "ok" | "up" | "closed" => Some(Self::Resolved),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
            Self::Unknown => "unknown",
        }
    }
}

/// Incident lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "incident_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolving,
    Resolved,
    Suppressed,
}

/// Where a maintenance window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "window_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    Email,
    Manual,
    Graph,
}

/// How a matching maintenance window treats alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "suppress_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SuppressMode {
    Mute,
    Downgrade,
    Digest,
}

impl SuppressMode {
    pub fn from_token(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mute" => Some(Self::Mute),
            "downgrade" => Some(Self::Downgrade),
            "digest" => Some(Self::Digest),
            _ => None,
        }
    }
}

/// Which stage of the parser produced an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "extraction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    Rule,
    Cached,
    LearnedNew,
    LlmFallback,
}

/// Human review decision on a quarantined extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "review_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    Rejected,
    Edited,
}

/// Dead-letter entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "dead_letter_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    Retrying,
    Failed,
    Resolved,
}

// sqlx's derive macro does not emit a `PgHasArrayType` impl for strong
// enums, but `store::dlq` binds `Vec<DeadLetterStatus>` as a query
// parameter, which requires it.
impl sqlx::postgres::PgHasArrayType for DeadLetterStatus {
    fn array_type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("_dead_letter_status")
    }
}

/// Idempotency reservation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(type_name = "idempotency_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
}

/// Immutable record of one ingested message. Content fields are never
/// mutated after insert; only `parse_status`/`parse_error` advance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct RawEmail {
    pub id: Uuid,
    /// Source folder the message was pulled from.
    pub folder: String,
    /// Folder-local monotonic UID assigned by the provider.
    pub uid: i64,
    /// RFC 5322 Message-ID with angle brackets stripped.
    pub message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    /// Parsed Date header, when present and sane.
    pub date_header: Option<DateTime<Utc>>,
    /// Case-folded header map (name -> value).
    pub headers: Value,
    pub body_text: String,
    pub body_html: Option<String>,
    /// Raw text/calendar part, when the message carried an invite.
    pub ics_payload: Option<String>,
    /// Attachment metadata (filename, content type, size).
    pub attachments: Value,
    pub received_at: DateTime<Utc>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
}

/// One normalized alert occurrence. Created by the parser, never mutated
/// (suppression flags are set before insert).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct AlertEvent {
    pub id: Uuid,
    pub raw_email_id: Option<Uuid>,
    /// Monitoring tool that emitted the alert (parser name).
    pub source_tool: String,
    pub environment: String,
    pub region: String,
    pub host: String,
    pub check_name: String,
    pub service: String,
    pub severity: Severity,
    pub state: AlertState,
    pub occurred_at: DateTime<Utc>,
    /// Human-readable one-line description of the condition.
    pub normalized_signature: String,
    /// 32-hex identity; see `fingerprint::fingerprint_v2`.
    pub fingerprint: String,
    /// Content hash used for repeat-occurrence detection.
    pub content_hash: String,
    pub payload: Value,
    pub tags: Vec<String>,
    pub is_suppressed: bool,
    pub suppression_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Correlated cluster of alert events sharing a fingerprint. At most one
/// row per fingerprint is live (`open`/`acknowledged`), enforced by a
/// partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct Incident {
    pub id: Uuid,
    pub fingerprint: String,
    pub title: String,
    pub source_tool: String,
    pub environment: String,
    pub region: String,
    pub host: String,
    pub check_name: String,
    pub service: String,
    pub status: IncidentStatus,
    pub severity_current: Severity,
    pub severity_max: Severity,
    pub last_state: AlertState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Timestamp of the latest firing event, used by the resolve
    /// quiet-period check.
    pub last_firing_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub event_count: i32,
    pub flap_count: i32,
    /// Observable label, not a separate status.
    pub is_flapping: bool,
    pub last_state_change_at: Option<DateTime<Utc>>,
    pub is_in_maintenance: bool,
    pub maintenance_window_id: Option<Uuid>,
    /// Enrichment written by an external collaborator; opaque here.
    pub ai_summary: Option<String>,
    pub ai_probable_cause: Option<String>,
    pub ai_enrichment: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Link between an incident and an alert event.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct IncidentEvent {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub alert_event_id: Uuid,
    /// True when the event repeated the previous occurrence verbatim.
    pub is_deduplicated: bool,
    pub created_at: DateTime<Utc>,
}

/// A (scope, time range, mode) tuple that suppresses matching alerts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    pub source: WindowSource,
    /// Calendar/event identifier for externally sourced windows.
    pub external_event_id: Option<String>,
    pub title: String,
    pub organizer: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// IANA zone the window was declared in.
    pub timezone: String,
    /// Selector map: key -> list of value-or-glob strings.
    pub scope: Value,
    pub suppress_mode: SuppressMode,
    pub is_active: bool,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Explainability record: which window matched which event/incident and
/// why.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct MaintenanceMatch {
    pub id: Uuid,
    pub window_id: Uuid,
    pub incident_id: Option<Uuid>,
    pub alert_event_id: Option<Uuid>,
    /// Selector-by-selector account of the match.
    pub match_reason: Value,
    pub created_at: DateTime<Utc>,
}

/// Learned extraction rule set keyed by format signature.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct PatternCacheEntry {
    pub id: Uuid,
    /// 64-hex hash of the format signature tuple.
    pub signature_hash: String,
    pub from_domain: String,
    pub subject_prefix: String,
    pub body_markers: Vec<String>,
    pub source_name: String,
    /// Field -> extraction rule (source, regex, group, map, keywords).
    pub extraction_rules: Value,
    pub match_count: i64,
    /// Percent, exponentially weighted.
    pub success_rate: f64,
    pub is_approved: bool,
    pub created_from_email_id: Option<Uuid>,
    pub last_matched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Audit record for every cache or LLM consultation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct PatternExtractionLogEntry {
    pub id: Uuid,
    pub raw_email_id: Option<Uuid>,
    pub signature_hash: Option<String>,
    pub extraction_type: ExtractionType,
    pub parser_name: Option<String>,
    pub confidence: Option<f64>,
    pub succeeded: bool,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Extraction that failed validation or fell below the confidence
/// threshold, held for human review.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct QuarantineEvent {
    pub id: Uuid,
    pub raw_email_id: Uuid,
    pub signature_hash: Option<String>,
    /// The candidate extraction as returned before rejection.
    pub candidate: Value,
    pub confidence: f64,
    pub reason: String,
    pub review_outcome: Option<ReviewOutcome>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Retry buffer entry for a processing step that exhausted local
/// retries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    /// Originating handler key (e.g. `parse_email`).
    pub event_type: String,
    pub payload: Value,
    pub error: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-folder resumable ingestion state.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct FolderCursor {
    pub folder: String,
    pub last_uid: i64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: i32,
    pub emails_processed: i64,
}

/// Versioned configuration snapshot stored before activation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, JsonSchema)]
pub struct ConfigVersion {
    pub id: i32,
    pub body: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Generic wrapper used by endpoints that return a single payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Pagination metadata accompanying list responses.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PageMetadata {
    /// One-based page index.
    pub page: i64,
    pub size: i64,
    #[serde(rename = "totalPages")]
    pub total_pages: i64,
    #[serde(rename = "totalElements")]
    pub total_elements: i64,
}

/// Wrapper for paginated datasets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page: PageMetadata,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, page: i64, size: i64, total_elements: i64) -> Self {
        let total_pages = if size > 0 {
            (total_elements + size - 1) / size
        } else {
            0
        };

        Self {
            data,
            page: PageMetadata {
                page,
                size,
                total_pages,
                total_elements,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_escalation() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_tokens_parse_loosely() {
        assert_eq!(Severity::from_token("P1"), Some(Severity::Critical));
        assert_eq!(Severity::from_token("RED"), Some(Severity::Critical));
        assert_eq!(Severity::from_token("warn"), Some(Severity::Medium));
        assert_eq!(Severity::from_token("bogus"), None);
    }

    #[test]
    fn downgrade_steps_one_level_and_saturates() {
        assert_eq!(Severity::Critical.downgraded(), Severity::High);
        assert_eq!(Severity::Info.downgraded(), Severity::Info);
    }

    #[test]
    fn recovery_tokens_mean_resolved() {
        assert_eq!(AlertState::from_token("OK"), Some(AlertState::Resolved));
        assert_eq!(
            AlertState::from_token("RECOVERY"),
            Some(AlertState::Resolved)
        );
        assert_eq!(AlertState::from_token("PROBLEM"), Some(AlertState::Firing));
    }
}
