//! Runtime configuration for the pipeline.
//!
//! Scalar knobs come from the environment with typed helpers; the
//! rule-based parser definitions come from a JSON document (path in
//! `NGS_PARSER_RULES_PATH`, falling back to a built-in default set).
//! Configuration errors are fail-fast: an invalid document is rejected
//! at load time and the previously active version stays active.

use crate::models::{ConfigVersion, Severity};
use rocket_db_pools::sqlx::PgPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read parser rules from {path}: {source}")]
    RulesIo {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse rules document: {0}")]
    RulesJson(#[from] serde_json::Error),
    #[error("parser `{parser}` has invalid regex `{pattern}`: {error}")]
    InvalidRegex {
        parser: String,
        pattern: String,
        error: String,
    },
    #[error("parser `{parser}` maps token `{token}` to unknown severity `{value}`")]
    UnknownSeverity {
        parser: String,
        token: String,
        value: String,
    },
    #[error("parser `{parser}` maps token `{token}` to unknown state `{value}`")]
    UnknownState {
        parser: String,
        token: String,
        value: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One rule-based parser definition as it appears in the rules document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserRuleConfig {
    /// Stable name, recorded as `source_tool` on produced events.
    pub name: String,
    /// Regex applied to the subject; a non-match skips this parser.
    pub subject_pattern: String,
    /// Optional sender-domain filter (exact, case-insensitive).
    #[serde(default)]
    pub from_domain: Option<String>,
    /// Field extraction regexes with named capture groups, applied to
    /// subject first, then body.
    #[serde(default)]
    pub field_patterns: BTreeMap<String, String>,
    /// Native severity token -> core enum name.
    #[serde(default)]
    pub severity_map: BTreeMap<String, String>,
    /// Native state token -> core enum name.
    #[serde(default)]
    pub state_map: BTreeMap<String, String>,
    #[serde(default)]
    pub static_tags: Vec<String>,
    /// Default environment when the message does not carry one.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// The parser rules document: an ordered list, tried first to last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserRulesDoc {
    pub parsers: Vec<ParserRuleConfig>,
}

impl ParserRulesDoc {
    /// Validate every regex and mapping target. Called before a
    /// document may become the active version.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for parser in &self.parsers {
            for pattern in std::iter::once(&parser.subject_pattern)
                .chain(parser.field_patterns.values())
            {
                if let Err(error) = regex::Regex::new(pattern) {
                    return Err(ConfigError::InvalidRegex {
                        parser: parser.name.clone(),
                        pattern: pattern.clone(),
                        error: error.to_string(),
                    });
                }
            }
            for (token, value) in &parser.severity_map {
                if Severity::from_token(value).is_none() {
                    return Err(ConfigError::UnknownSeverity {
                        parser: parser.name.clone(),
                        token: token.clone(),
                        value: value.clone(),
                    });
                }
            }
            for (token, value) in &parser.state_map {
                if crate::models::AlertState::from_token(value).is_none() {
                    return Err(ConfigError::UnknownState {
                        parser: parser.name.clone(),
                        token: token.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Built-in rule set used when no rules document is configured. Covers
/// the classic Nagios-style subject grammar and a generic bracketed
/// format.
pub fn default_rules() -> ParserRulesDoc {
    let doc = serde_json::json!({
        "parsers": [
            {
                "name": "nagios",
                "subject_pattern": r"^\*\*\s*(?P<state>PROBLEM|RECOVERY|FLAPPINGSTART|FLAPPINGSTOP)\s*\*\*",
                "field_patterns": {
                    "host": r"Host:\s*(?P<host>\S+)",
                    "service": r"Service:\s*(?P<service>\S+)",
                    "severity": r"State:\s*(?P<severity>\S+)"
                },
                "severity_map": {
                    "CRITICAL": "critical",
                    "WARNING": "warning",
                    "UNKNOWN": "medium",
                    "OK": "info"
                },
                "state_map": {
                    "PROBLEM": "firing",
                    "FLAPPINGSTART": "firing",
                    "RECOVERY": "resolved",
                    "FLAPPINGSTOP": "resolved"
                },
                "static_tags": ["nagios"]
            },
            {
                "name": "generic-bracket",
                "subject_pattern": r"^\[(?P<severity>[A-Za-z0-9]+)\]\s*(?P<check>.+)$",
                "field_patterns": {
                    "host": r"(?mi)^host:\s*(?P<host>\S+)",
                    "service": r"(?mi)^service:\s*(?P<service>\S+)",
                    "environment": r"(?mi)^env(?:ironment)?:\s*(?P<environment>\S+)",
                    "state": r"(?mi)^status:\s*(?P<state>\S+)"
                },
                "severity_map": {},
                "state_map": {},
                "static_tags": []
            }
        ]
    });
    serde_json::from_value(doc).expect("built-in rules document is well-formed")
}

/// Correlator tuning (§ correlation configuration surface).
#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub dedup_window: Duration,
    pub flap_threshold: i32,
    pub flap_window: Duration,
    pub resolve_quiet_period: Duration,
    pub auto_resolve_after: Duration,
    /// Always true; kept for the configuration surface contract.
    pub single_open_per_fingerprint: bool,
    pub sweep_interval: Duration,
}

impl CorrelationConfig {
    pub fn from_env() -> Self {
        Self {
            dedup_window: Duration::from_secs(env_u64("NGS_DEDUP_WINDOW_MINUTES", 15) * 60),
            flap_threshold: env_u32("NGS_FLAP_THRESHOLD", 5) as i32,
            flap_window: Duration::from_secs(env_u64("NGS_FLAP_WINDOW_MINUTES", 30) * 60),
            resolve_quiet_period: env_duration_secs("NGS_RESOLVE_QUIET_PERIOD_SECONDS", 120),
            auto_resolve_after: Duration::from_secs(env_u64("NGS_AUTO_RESOLVE_HOURS", 24) * 3600),
            single_open_per_fingerprint: true,
            sweep_interval: env_duration_secs("NGS_AUTO_RESOLVE_SWEEP_SECONDS", 300),
        }
    }
}

/// Maintenance engine tuning.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Subject prefixes that mark a maintenance announcement.
    pub subject_prefixes: Vec<String>,
    pub tick_interval: Duration,
    pub window_cache_ttl: Duration,
}

impl MaintenanceConfig {
    pub fn from_env() -> Self {
        let prefixes = env_string("NGS_MAINTENANCE_SUBJECT_PREFIXES", "[MW],Maintenance:");
        Self {
            subject_prefixes: prefixes
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            tick_interval: env_duration_secs("NGS_MAINTENANCE_TICK_SECONDS", 60),
            window_cache_ttl: env_duration_secs("NGS_WINDOW_CACHE_TTL_SECONDS", 30),
        }
    }
}

/// Language-model client tuning.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub min_confidence: f64,
    pub request_timeout: Duration,
    pub requests_per_minute: u32,
    pub max_in_flight: usize,
    /// Bound on the body excerpt sent upstream, in bytes (UTF-8 safe).
    pub body_excerpt_bytes: usize,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env_string("NGS_LLM_ENDPOINT", "http://localhost:11434/api/extract"),
            model: env_string("NGS_LLM_MODEL", "alert-extractor"),
            min_confidence: env_f64("NGS_LLM_MIN_CONFIDENCE", 0.60),
            request_timeout: env_duration_secs("NGS_LLM_TIMEOUT_SECONDS", 15),
            requests_per_minute: env_u32("NGS_LLM_RPM", 60),
            max_in_flight: env_u32("NGS_LLM_MAX_IN_FLIGHT", 4) as usize,
            body_excerpt_bytes: env_u64("NGS_LLM_BODY_EXCERPT_BYTES", 8192) as usize,
        }
    }
}

/// Parser-stage thresholds.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Minimum cache success rate (percent) for a cached rule set to be
    /// applied.
    pub cache_min_success: f64,
    /// Below this confidence an extraction goes to quarantine.
    pub quarantine_confidence_threshold: f64,
}

impl ParserConfig {
    pub fn from_env() -> Self {
        Self {
            cache_min_success: env_f64("NGS_CACHE_MIN_SUCCESS", 70.0),
            quarantine_confidence_threshold: env_f64("NGS_QUARANTINE_CONFIDENCE", 0.60),
        }
    }
}

/// Dead-letter queue tuning.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub base_backoff: Duration,
    pub cap_backoff: Duration,
    pub max_retries: i32,
    pub sweep_interval: Duration,
}

impl DlqConfig {
    pub fn from_env() -> Self {
        Self {
            base_backoff: env_duration_secs("NGS_DLQ_BASE_BACKOFF_SECONDS", 30),
            cap_backoff: env_duration_secs("NGS_DLQ_CAP_BACKOFF_SECONDS", 3600),
            max_retries: env_u32("NGS_DLQ_MAX_RETRIES", 5) as i32,
            sweep_interval: env_duration_secs("NGS_DLQ_SWEEP_SECONDS", 60),
        }
    }
}

/// Idempotency store tuning.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    /// `processing` reservations older than this may be reclaimed.
    pub stale_after: Duration,
    pub cleanup_interval: Duration,
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_u64("NGS_IDEMPOTENCY_TTL_HOURS", 24) * 3600),
            stale_after: env_duration_secs("NGS_IDEMPOTENCY_STALE_SECONDS", 300),
            cleanup_interval: env_duration_secs("NGS_IDEMPOTENCY_CLEANUP_SECONDS", 3600),
        }
    }
}

/// Which mail provider backs the ingesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Imap,
    Graph,
    Maildir,
}

/// Ingestion tuning and folder list.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub provider: ProviderKind,
    pub folders: Vec<String>,
    pub batch_size: i64,
    /// Pending raw emails older than this are re-enqueued by the
    /// reprocess sweeper.
    pub reprocess_after: Duration,
    pub reprocess_interval: Duration,
    pub parse_workers: usize,
    pub parse_queue_capacity: usize,
    /// Base poll interval; providers may override.
    pub poll_interval: Duration,
    pub imap: ImapSettings,
    pub graph: GraphSettings,
    pub maildir_root: String,
}

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Microsoft Graph connection settings.
#[derive(Debug, Clone)]
pub struct GraphSettings {
    pub base_url: String,
    pub access_token: String,
    pub mailbox: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let provider = match env_string("NGS_MAIL_PROVIDER", "maildir").to_lowercase().as_str() {
            "imap" => ProviderKind::Imap,
            "graph" => ProviderKind::Graph,
            _ => ProviderKind::Maildir,
        };
        let folders = env_string("NGS_MAIL_FOLDERS", "INBOX")
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        Self {
            provider,
            folders,
            batch_size: env_u64("NGS_INGEST_BATCH_SIZE", 100) as i64,
            reprocess_after: env_duration_secs("NGS_REPROCESS_AFTER_SECONDS", 600),
            reprocess_interval: env_duration_secs("NGS_REPROCESS_SWEEP_SECONDS", 120),
            parse_workers: env_u32("NGS_PARSE_WORKERS", 4) as usize,
            parse_queue_capacity: env_u32("NGS_PARSE_QUEUE_CAPACITY", 256) as usize,
            poll_interval: env_duration_secs("NGS_POLL_INTERVAL_SECONDS", 60),
            imap: ImapSettings {
                host: env_string("NGS_IMAP_HOST", "localhost"),
                port: env_u32("NGS_IMAP_PORT", 993) as u16,
                username: env_string("NGS_IMAP_USERNAME", ""),
                password: env_string("NGS_IMAP_PASSWORD", ""),
            },
            graph: GraphSettings {
                base_url: env_string("NGS_GRAPH_BASE_URL", "https://graph.microsoft.com/v1.0"),
                access_token: env_string("NGS_GRAPH_TOKEN", ""),
                mailbox: env_string("NGS_GRAPH_MAILBOX", "alerts@example.com"),
            },
            maildir_root: env_string("NGS_MAILDIR_ROOT", "./mail-drop"),
        }
    }
}

/// The full configuration snapshot consumed at startup and on reload.
#[derive(Debug, Clone)]
pub struct NgsConfig {
    pub rules: ParserRulesDoc,
    pub parser: ParserConfig,
    pub correlation: CorrelationConfig,
    pub maintenance: MaintenanceConfig,
    pub llm: LlmConfig,
    pub dlq: DlqConfig,
    pub idempotency: IdempotencyConfig,
    pub ingest: IngestConfig,
}

impl NgsConfig {
    /// Load and validate the whole configuration. A rules document that
    /// fails validation rejects the load (the caller keeps whatever was
    /// active before).
    pub fn from_env() -> Result<Self, ConfigError> {
        let rules = match env_opt_string("NGS_PARSER_RULES_PATH") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::RulesIo { path, source })?;
                serde_json::from_str::<ParserRulesDoc>(&raw)?
            }
            None => default_rules(),
        };
        rules.validate()?;

        Ok(Self {
            rules,
            parser: ParserConfig::from_env(),
            correlation: CorrelationConfig::from_env(),
            maintenance: MaintenanceConfig::from_env(),
            llm: LlmConfig::from_env(),
            dlq: DlqConfig::from_env(),
            idempotency: IdempotencyConfig::from_env(),
            ingest: IngestConfig::from_env(),
        })
    }
}

/// Persistence for versioned configuration documents.
pub struct ConfigVersionStore {
    pool: PgPool,
}

impl ConfigVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a validated rules document as a new version and activate
    /// it, deactivating the previous one.
    pub async fn activate(&self, doc: &ParserRulesDoc) -> Result<i32, ConfigError> {
        doc.validate()?;
        let body = serde_json::to_value(doc)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE config_versions SET is_active = FALSE WHERE is_active")
            .execute(&mut *tx)
            .await?;
        let (id,): (i32,) = sqlx::query_as(
            "INSERT INTO config_versions (body, is_active) VALUES ($1, TRUE) RETURNING id",
        )
        .bind(body)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        log::info!("activated parser rules config version {}", id);
        Ok(id)
    }

    /// Roll back to a previously stored version.
    pub async fn rollback(&self, version_id: i32) -> Result<ParserRulesDoc, ConfigError> {
        let mut tx = self.pool.begin().await?;
        let (body,): (serde_json::Value,) =
            sqlx::query_as("SELECT body FROM config_versions WHERE id = $1")
                .bind(version_id)
                .fetch_one(&mut *tx)
                .await?;
        let doc: ParserRulesDoc = serde_json::from_value(body)?;
        doc.validate()?;

        sqlx::query("UPDATE config_versions SET is_active = FALSE WHERE is_active")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE config_versions SET is_active = TRUE WHERE id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        log::info!("rolled back parser rules to config version {}", version_id);
        Ok(doc)
    }

    /// Load the active rules document, if any has been stored.
    pub async fn load_active(&self) -> Result<Option<ConfigVersion>, ConfigError> {
        let row = sqlx::query_as::<_, ConfigVersion>(
            "SELECT id, body, is_active, created_at FROM config_versions WHERE is_active LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_validate() {
        default_rules().validate().expect("built-in rules are valid");
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut doc = default_rules();
        doc.parsers[0].subject_pattern = "([unclosed".to_string();
        assert!(matches!(
            doc.validate(),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn unknown_severity_target_is_rejected() {
        let mut doc = default_rules();
        doc.parsers[0]
            .severity_map
            .insert("PURPLE".to_string(), "apocalyptic".to_string());
        assert!(matches!(
            doc.validate(),
            Err(ConfigError::UnknownSeverity { .. })
        ));
    }
}
