//! Maintenance-window detection from inbound mail.
//!
//! Two sources: a structured body form (Title/Scope/Mode/Start/End/
//! Timezone lines) behind recognized subject prefixes, and calendar
//! invite payloads. When both are present the calendar's start/end and
//! recurrence override the body values.

use crate::maintenance::ics;
use crate::maintenance::scope::parse_selector_list;
use crate::models::{SuppressMode, WindowSource};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("no maintenance announcement found")]
    NotAnAnnouncement,
    #[error("body form is missing `{0}`")]
    MissingField(&'static str),
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("window ends before it starts")]
    EmptyRange,
    #[error("calendar payload rejected: {0}")]
    Ics(#[from] ics::IcsError),
}

/// A window parsed from mail, ready for insertion.
#[derive(Debug, Clone)]
pub struct WindowCandidate {
    pub source: WindowSource,
    pub external_event_id: Option<String>,
    pub title: String,
    pub organizer: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub timezone: String,
    pub scope: Value,
    pub suppress_mode: SuppressMode,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
}

/// Does the subject carry one of the configured maintenance prefixes?
pub fn subject_is_announcement(subject: &str, prefixes: &[String]) -> bool {
    let trimmed = subject.trim_start();
    prefixes.iter().any(|p| trimmed.starts_with(p.as_str()))
}

fn body_field<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    body.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn parse_local_timestamp(raw: &str, zone: &Tz) -> Result<DateTime<Utc>, DetectError> {
    // The canonical body form is `YYYY-MM-DD HH:MM`; tolerate seconds
    // and RFC 3339 instants.
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return zone
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| DetectError::InvalidTimestamp(raw.to_string()));
        }
    }

    dateparser::parse(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DetectError::InvalidTimestamp(raw.to_string()))
}

/// Parse the structured body form into a candidate.
pub fn window_from_body(subject: &str, body: &str) -> Result<WindowCandidate, DetectError> {
    let timezone = body_field(body, "Timezone").unwrap_or("UTC").to_string();
    let zone =
        Tz::from_str(&timezone).map_err(|_| DetectError::UnknownTimezone(timezone.clone()))?;

    let start_raw = body_field(body, "Start").ok_or(DetectError::MissingField("Start"))?;
    let end_raw = body_field(body, "End").ok_or(DetectError::MissingField("End"))?;
    let starts_at = parse_local_timestamp(start_raw, &zone)?;
    let ends_at = parse_local_timestamp(end_raw, &zone)?;
    if ends_at <= starts_at {
        return Err(DetectError::EmptyRange);
    }

    let scope_raw = body_field(body, "Scope").ok_or(DetectError::MissingField("Scope"))?;
    let scope = parse_selector_list(scope_raw).map_err(DetectError::InvalidScope)?;

    let suppress_mode = body_field(body, "Mode")
        .and_then(SuppressMode::from_token)
        .unwrap_or(SuppressMode::Mute);

    let title = body_field(body, "Title")
        .map(str::to_string)
        .unwrap_or_else(|| subject.trim().to_string());

    Ok(WindowCandidate {
        source: WindowSource::Email,
        external_event_id: None,
        title,
        organizer: None,
        starts_at,
        ends_at,
        timezone,
        scope,
        suppress_mode,
        is_recurring: false,
        recurrence_rule: None,
    })
}

/// Detect a maintenance window in a message. Returns
/// `NotAnAnnouncement` when neither the subject prefix nor a calendar
/// payload marks the message.
pub fn detect(
    subject: &str,
    body: &str,
    ics_payload: Option<&str>,
    from_addr: &str,
    prefixes: &[String],
) -> Result<WindowCandidate, DetectError> {
    let announced = subject_is_announcement(subject, prefixes);

    if let Some(payload) = ics_payload {
        let event = ics::parse_event(payload)?;
        // Best-effort body form; the calendar payload overrides timing.
        let base = window_from_body(subject, body).ok();

        let scope = base.as_ref().map(|c| c.scope.clone()).unwrap_or_else(
            // An invite without a scope form creates a window that
            // matches nothing until an operator scopes it.
            || Value::Object(serde_json::Map::new()),
        );
        let suppress_mode = base
            .as_ref()
            .map(|c| c.suppress_mode)
            .unwrap_or(SuppressMode::Mute);

        if event.ends_at <= event.starts_at {
            return Err(DetectError::EmptyRange);
        }

        return Ok(WindowCandidate {
            source: WindowSource::Email,
            external_event_id: event.uid,
            title: event
                .summary
                .or_else(|| base.as_ref().map(|c| c.title.clone()))
                .unwrap_or_else(|| subject.trim().to_string()),
            organizer: event.organizer.or_else(|| {
                if from_addr.is_empty() {
                    None
                } else {
                    Some(from_addr.to_lowercase())
                }
            }),
            starts_at: event.starts_at,
            ends_at: event.ends_at,
            timezone: event
                .timezone
                .or_else(|| base.as_ref().map(|c| c.timezone.clone()))
                .unwrap_or_else(|| "UTC".to_string()),
            scope,
            suppress_mode,
            is_recurring: event.recurrence_rule.is_some(),
            recurrence_rule: event.recurrence_rule,
        });
    }

    if announced {
        window_from_body(subject, body)
    } else {
        Err(DetectError::NotAnAnnouncement)
    }
}
