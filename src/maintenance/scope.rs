//! Maintenance scope selectors and matching.
//!
//! A scope is a map from selector key (`host`, `service`, `env`,
//! `region`, `tag`) to one or more values. Hosts and services accept
//! glob (`*`, `?`) patterns and an explicit `/regex/` alternative;
//! environments, regions and tags match exactly. Keys combine with AND,
//! values within a key with OR. An empty scope matches nothing.

use regex::Regex;
use serde_json::{Map, Value};
use std::fmt;

/// Selector keys in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKey {
    Host,
    Service,
    Env,
    Region,
    Tag,
}

impl SelectorKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Some(Self::Host),
            "service" => Some(Self::Service),
            "env" | "environment" => Some(Self::Env),
            "region" => Some(Self::Region),
            "tag" => Some(Self::Tag),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Service => "service",
            Self::Env => "env",
            Self::Region => "region",
            Self::Tag => "tag",
        }
    }

    fn supports_patterns(self) -> bool {
        matches!(self, Self::Host | Self::Service)
    }
}

impl fmt::Display for SelectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields of an event or incident a scope is matched against.
#[derive(Debug, Clone, Default)]
pub struct ScopeTarget<'a> {
    pub host: &'a str,
    pub service: &'a str,
    pub env: &'a str,
    pub region: &'a str,
    pub tags: &'a [String],
}

/// One satisfied selector, for the explainability record.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorHit {
    pub key: &'static str,
    pub pattern: String,
    pub value: String,
}

/// Translate a glob pattern (`*`, `?`) into an anchored regex.
fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// Match a single selector value against a candidate string.
fn value_matches(key: SelectorKey, pattern: &str, candidate: &str) -> bool {
    if candidate.is_empty() {
        return false;
    }

    if key.supports_patterns() {
        // `/.../` selects the regex alternative.
        if let Some(inner) = pattern
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            return Regex::new(inner)
                .map(|re| re.is_match(candidate))
                .unwrap_or(false);
        }
        if pattern.contains('*') || pattern.contains('?') {
            return glob_to_regex(pattern)
                .map(|re| re.is_match(candidate))
                .unwrap_or(false);
        }
    }

    pattern.eq_ignore_ascii_case(candidate)
}

fn selector_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Evaluate a scope document against a target. Returns the selector
/// hits when every present key matched, `None` otherwise. An empty
/// scope returns `None`: a window without scope never suppresses.
pub fn matches(scope: &Value, target: &ScopeTarget<'_>) -> Option<Vec<SelectorHit>> {
    let map: &Map<String, Value> = scope.as_object()?;
    if map.is_empty() {
        return None;
    }

    let mut hits = Vec::new();

    for (raw_key, raw_values) in map {
        let key = SelectorKey::parse(raw_key)?;
        let values = selector_values(raw_values);
        if values.is_empty() {
            return None;
        }

        let hit = match key {
            SelectorKey::Tag => values.iter().find_map(|pattern| {
                target
                    .tags
                    .iter()
                    .find(|tag| pattern.eq_ignore_ascii_case(tag))
                    .map(|tag| SelectorHit {
                        key: key.as_str(),
                        pattern: pattern.clone(),
                        value: tag.clone(),
                    })
            }),
            _ => {
                let candidate = match key {
                    SelectorKey::Host => target.host,
                    SelectorKey::Service => target.service,
                    SelectorKey::Env => target.env,
                    SelectorKey::Region => target.region,
                    SelectorKey::Tag => unreachable!(),
                };
                values
                    .iter()
                    .find(|pattern| value_matches(key, pattern, candidate))
                    .map(|pattern| SelectorHit {
                        key: key.as_str(),
                        pattern: pattern.clone(),
                        value: candidate.to_string(),
                    })
            }
        };

        match hit {
            Some(hit) => hits.push(hit),
            None => return None,
        }
    }

    Some(hits)
}

/// Parse a selector-list string (`host=web-*; service=http,db`) into a
/// scope document. Unknown keys are rejected.
pub fn parse_selector_list(input: &str) -> Result<Value, String> {
    let mut map = Map::new();

    for part in input.split([';', '\n']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, values) = part
            .split_once('=')
            .ok_or_else(|| format!("selector `{}` is missing `=`", part))?;
        let key = SelectorKey::parse(key.trim())
            .ok_or_else(|| format!("unknown selector key `{}`", key.trim()))?;

        let list: Vec<Value> = values
            .split(',')
            .map(|v| Value::String(v.trim().to_string()))
            .filter(|v| v.as_str().map(|s| !s.is_empty()).unwrap_or(false))
            .collect();
        if list.is_empty() {
            return Err(format!("selector `{}` has no values", key));
        }

        map.insert(key.as_str().to_string(), Value::Array(list));
    }

    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target<'a>(host: &'a str, service: &'a str, env: &'a str, tags: &'a [String]) -> ScopeTarget<'a> {
        ScopeTarget {
            host,
            service,
            env,
            region: "",
            tags,
        }
    }

    #[test]
    fn glob_matches_hosts() {
        let scope = serde_json::json!({"host": ["web-*"]});
        let hits = matches(&scope, &target("web-01", "", "", &[])).expect("glob hit");
        assert_eq!(hits[0].key, "host");
        assert_eq!(hits[0].pattern, "web-*");
        assert_eq!(hits[0].value, "web-01");

        assert!(matches(&scope, &target("db-01", "", "", &[])).is_none());
    }

    #[test]
    fn question_mark_matches_single_char() {
        let scope = serde_json::json!({"host": ["web-0?"]});
        assert!(matches(&scope, &target("web-01", "", "", &[])).is_some());
        assert!(matches(&scope, &target("web-011", "", "", &[])).is_none());
    }

    #[test]
    fn regex_alternative_for_services() {
        let scope = serde_json::json!({"service": ["/^http(s)?$/"]});
        assert!(matches(&scope, &target("x", "https", "", &[])).is_some());
        assert!(matches(&scope, &target("x", "httpd", "", &[])).is_none());
    }

    #[test]
    fn keys_combine_with_and_values_with_or() {
        let scope = serde_json::json!({"host": ["web-*", "db-*"], "env": ["prod"]});
        assert!(matches(&scope, &target("db-02", "", "prod", &[])).is_some());
        assert!(matches(&scope, &target("db-02", "", "staging", &[])).is_none());
    }

    #[test]
    fn env_matches_exactly_no_glob() {
        let scope = serde_json::json!({"env": ["pro*"]});
        assert!(matches(&scope, &target("x", "", "prod", &[])).is_none());
    }

    #[test]
    fn tags_match_exactly() {
        let tags = vec!["datacenter=eu-1".to_string()];
        let scope = serde_json::json!({"tag": ["datacenter=eu-1"]});
        assert!(matches(&scope, &target("x", "", "", &tags)).is_some());
    }

    #[test]
    fn empty_scope_matches_nothing() {
        let scope = serde_json::json!({});
        assert!(matches(&scope, &target("web-01", "http", "prod", &[])).is_none());
    }

    #[test]
    fn selector_list_round_trip() {
        let scope = parse_selector_list("host=web-*; service=http,db; env=prod").unwrap();
        assert_eq!(scope["host"], serde_json::json!(["web-*"]));
        assert_eq!(scope["service"], serde_json::json!(["http", "db"]));

        assert!(parse_selector_list("planet=earth").is_err());
        assert!(parse_selector_list("host=").is_err());
    }
}
