//! Rule-based extraction: the first parser stage.
//!
//! Rules come from the configuration surface as regex definitions and
//! are compiled once at load time (compile failures reject the whole
//! document). The same extraction-rule JSON grammar is also produced by
//! the LLM and stored in the pattern cache, so the application logic
//! here is shared by all three stages.

use crate::config::{ParserRuleConfig, ParserRulesDoc};
use crate::models::{AlertState, Severity};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

static RE_TAG_FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z][A-Za-z0-9_]{0,31})=([A-Za-z0-9][A-Za-z0-9_.\-]{0,63})\b").unwrap()
});

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Fields pulled out of a message by any extraction stage, before
/// normalization into an event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub host: String,
    pub service: String,
    pub check_name: String,
    pub environment: String,
    pub region: String,
    pub severity_token: String,
    pub state_token: String,
}

/// Errors raised while applying a stored extraction-rule document.
#[derive(Debug, Error)]
pub enum RuleApplyError {
    #[error("rule for field `{field}` is not an object")]
    MalformedRule { field: String },
    #[error("rule for field `{field}` has invalid regex `{pattern}`: {error}")]
    InvalidRegex {
        field: String,
        pattern: String,
        error: String,
    },
    #[error("rule for field `{field}` names unknown source `{source_name}`")]
    UnknownSource { field: String, source_name: String },
}

/// One rule-based parser with its regexes compiled.
pub struct CompiledRule {
    pub name: String,
    pub subject_pattern: Regex,
    pub from_domain: Option<String>,
    pub field_patterns: Vec<(String, Regex)>,
    pub severity_map: BTreeMap<String, Severity>,
    pub state_map: BTreeMap<String, AlertState>,
    pub static_tags: Vec<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
}

impl CompiledRule {
    fn compile(config: &ParserRuleConfig) -> Option<Self> {
        // The document was validated at load time; a failure here means
        // the config store was bypassed, so skip the rule and log.
        let subject_pattern = match Regex::new(&config.subject_pattern) {
            Ok(re) => re,
            Err(e) => {
                log::error!("parser {}: bad subject pattern: {}", config.name, e);
                return None;
            }
        };

        let mut field_patterns = Vec::new();
        for (field, pattern) in &config.field_patterns {
            match Regex::new(pattern) {
                Ok(re) => field_patterns.push((field.clone(), re)),
                Err(e) => {
                    log::error!("parser {}: bad pattern for {}: {}", config.name, field, e);
                    return None;
                }
            }
        }

        let severity_map = config
            .severity_map
            .iter()
            .filter_map(|(token, value)| {
                Severity::from_token(value).map(|s| (token.to_uppercase(), s))
            })
            .collect();
        let state_map = config
            .state_map
            .iter()
            .filter_map(|(token, value)| {
                AlertState::from_token(value).map(|s| (token.to_uppercase(), s))
            })
            .collect();

        Some(Self {
            name: config.name.clone(),
            subject_pattern,
            from_domain: config.from_domain.as_ref().map(|d| d.to_lowercase()),
            field_patterns,
            severity_map,
            state_map,
            static_tags: config.static_tags.clone(),
            environment: config.environment.clone(),
            region: config.region.clone(),
        })
    }

    /// Try this rule against a message. `None` means the rule does not
    /// claim the message (subject or sender filter missed).
    pub fn try_extract(&self, subject: &str, from_addr: &str, body: &str) -> Option<Extraction> {
        if let Some(domain) = &self.from_domain {
            if !crate::parse::signature::from_domain(from_addr).eq(domain) {
                return None;
            }
        }

        let subject_caps = self.subject_pattern.captures(subject)?;

        let mut extraction = Extraction {
            environment: self.environment.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            ..Extraction::default()
        };

        // Named groups on the subject pattern seed the extraction.
        for name in self.subject_pattern.capture_names().flatten() {
            if let Some(m) = subject_caps.name(name) {
                assign_field(&mut extraction, name, m.as_str());
            }
        }

        // Field patterns run against the subject first, then the body.
        for (field, pattern) in &self.field_patterns {
            let captured = pattern
                .captures(subject)
                .or_else(|| pattern.captures(body));
            if let Some(caps) = captured {
                let value = caps
                    .name(field.as_str())
                    .or_else(|| caps.get(1))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                assign_field(&mut extraction, field, value);
            }
        }

        Some(extraction)
    }

    /// Map a native severity token through this parser's table; unknown
    /// tokens fall back to the global loose table, then to `Medium`.
    pub fn map_severity(&self, token: &str) -> Severity {
        self.severity_map
            .get(&token.to_uppercase())
            .copied()
            .or_else(|| Severity::from_token(token))
            .unwrap_or(Severity::Medium)
    }

    /// Map a native state token; unknown tokens become `Unknown`.
    pub fn map_state(&self, token: &str) -> AlertState {
        self.state_map
            .get(&token.to_uppercase())
            .copied()
            .or_else(|| AlertState::from_token(token))
            .unwrap_or(AlertState::Unknown)
    }
}

fn assign_field(extraction: &mut Extraction, field: &str, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    match field {
        "host" => extraction.host = value.to_string(),
        "service" => extraction.service = value.to_string(),
        "check" | "check_name" => extraction.check_name = value.to_string(),
        "environment" | "env" => extraction.environment = value.to_string(),
        "region" => extraction.region = value.to_string(),
        "severity" => extraction.severity_token = value.to_string(),
        "state" => extraction.state_token = value.to_string(),
        _ => {}
    }
}

/// The ordered, compiled rule set.
pub struct RuleSet {
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(doc: &ParserRulesDoc) -> Self {
        let rules = doc.parsers.iter().filter_map(CompiledRule::compile).collect();
        Self { rules }
    }

    /// First matching rule wins (document order).
    pub fn try_extract<'a>(
        &'a self,
        subject: &str,
        from_addr: &str,
        body: &str,
    ) -> Option<(&'a CompiledRule, Extraction)> {
        self.rules.iter().find_map(|rule| {
            rule.try_extract(subject, from_addr, body)
                .map(|extraction| (rule, extraction))
        })
    }
}

/// Apply a stored extraction-rule document (`field -> {source, regex,
/// group?, map?}`) to a message. Used for cached patterns and for the
/// self-consistency check on LLM output.
pub fn apply_rule_document(
    rules: &Value,
    subject: &str,
    body: &str,
) -> Result<BTreeMap<String, String>, RuleApplyError> {
    let mut out = BTreeMap::new();
    let Some(map) = rules.as_object() else {
        return Ok(out);
    };

    for (field, rule) in map {
        let Some(rule_obj) = rule.as_object() else {
            return Err(RuleApplyError::MalformedRule {
                field: field.clone(),
            });
        };

        let source = rule_obj
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("body");
        let text = match source {
            "subject" => subject,
            "body" => body,
            other => {
                return Err(RuleApplyError::UnknownSource {
                    field: field.clone(),
                    source_name: other.to_string(),
                });
            }
        };

        let Some(pattern) = rule_obj.get("regex").and_then(Value::as_str) else {
            continue;
        };
        let re = Regex::new(pattern).map_err(|e| RuleApplyError::InvalidRegex {
            field: field.clone(),
            pattern: pattern.to_string(),
            error: e.to_string(),
        })?;

        let group = rule_obj
            .get("group")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;

        if let Some(caps) = re.captures(text) {
            let raw = caps
                .get(group)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            if raw.is_empty() {
                continue;
            }

            // Optional token map rewrites the captured value.
            let mapped = rule_obj
                .get("map")
                .and_then(Value::as_object)
                .and_then(|m| m.get(&raw.to_uppercase()).or_else(|| m.get(&raw)))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or(raw);
            out.insert(field.clone(), mapped);
        }
    }

    Ok(out)
}

/// Host normalization: lowercase, trailing dot stripped.
pub fn normalize_host(host: &str) -> String {
    crate::fingerprint::canonical_host(host)
}

/// Build the human-readable normalized signature from a subject. The
/// extracted severity and state tokens are stripped first: the
/// signature describes what the alert is about, so `State: CRITICAL`
/// and `State: WARNING` variants of the same condition must collapse to
/// one signature (and one fingerprint).
pub fn normalized_signature(subject: &str, volatile_tokens: &[&str]) -> String {
    let mut cleaned = subject.replace('\0', "");
    for token in volatile_tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(token))) {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
    }
    RE_WHITESPACE
        .replace_all(cleaned.trim(), " ")
        .into_owned()
}

/// Union of static tags and `key=value` fragments found in the body.
pub fn collect_tags(static_tags: &[String], body: &str) -> Vec<String> {
    let mut tags: Vec<String> = static_tags.to_vec();
    for caps in RE_TAG_FRAGMENT.captures_iter(body).take(32) {
        let tag = format!("{}={}", &caps[1], &caps[2]);
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_rules;

    fn ruleset() -> RuleSet {
        RuleSet::compile(&default_rules())
    }

    #[test]
    fn nagios_problem_subject_extracts_fields() {
        let rules = ruleset();
        let (rule, extraction) = rules
            .try_extract(
                "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
                "nagios@monitoring.example.com",
                "",
            )
            .expect("nagios rule matches");

        assert_eq!(rule.name, "nagios");
        assert_eq!(extraction.host, "web-01");
        assert_eq!(extraction.service, "http");
        assert_eq!(extraction.severity_token, "CRITICAL");
        assert_eq!(extraction.state_token, "PROBLEM");
        assert_eq!(rule.map_severity("CRITICAL"), Severity::Critical);
        assert_eq!(rule.map_state("PROBLEM"), AlertState::Firing);
    }

    #[test]
    fn recovery_subject_maps_to_resolved() {
        let rules = ruleset();
        let (rule, extraction) = rules
            .try_extract(
                "** RECOVERY ** Host: web-01 Service: http State: OK",
                "nagios@monitoring.example.com",
                "",
            )
            .expect("nagios rule matches");

        assert_eq!(rule.map_state(&extraction.state_token), AlertState::Resolved);
        assert_eq!(rule.map_severity(&extraction.severity_token), Severity::Info);
    }

    #[test]
    fn unknown_severity_token_defaults_to_medium() {
        let rules = ruleset();
        let rule = &rules.rules[0];
        assert_eq!(rule.map_severity("MAGENTA"), Severity::Medium);
    }

    #[test]
    fn rule_document_application_honors_group_and_map() {
        let doc = serde_json::json!({
            "host": {"source": "body", "regex": r"host=(\S+)"},
            "severity": {
                "source": "subject",
                "regex": r"\[(\w+)\]",
                "map": {"RED": "critical"}
            }
        });

        let out = apply_rule_document(&doc, "[RED] disk alert", "host=db-01 more").unwrap();
        assert_eq!(out.get("host").map(String::as_str), Some("db-01"));
        assert_eq!(out.get("severity").map(String::as_str), Some("critical"));
    }

    #[test]
    fn rule_document_rejects_bad_regex() {
        let doc = serde_json::json!({"host": {"source": "body", "regex": "(unclosed"}});
        assert!(matches!(
            apply_rule_document(&doc, "", ""),
            Err(RuleApplyError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn normalized_signature_is_severity_and_state_independent() {
        let firing = normalized_signature(
            "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
            &["CRITICAL", "PROBLEM"],
        );
        let warning = normalized_signature(
            "** PROBLEM ** Host: web-01 Service: http State: WARNING",
            &["WARNING", "PROBLEM"],
        );
        let recovered = normalized_signature(
            "** RECOVERY ** Host: web-01 Service: http State: OK",
            &["OK", "RECOVERY"],
        );
        assert_eq!(firing, warning);
        assert_eq!(firing, recovered);
        assert!(firing.contains("web-01"));
    }

    #[test]
    fn tags_union_static_and_body_fragments() {
        let tags = collect_tags(
            &["nagios".to_string()],
            "datacenter=eu-1 rack=b12 datacenter=eu-1",
        );
        assert_eq!(tags, vec!["nagios", "datacenter=eu-1", "rack=b12"]);
    }
}
