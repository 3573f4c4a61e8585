//! Minimal iCalendar (RFC 5545) VEVENT extraction.
//!
//! Only the properties the maintenance engine needs are read: DTSTART,
//! DTEND, SUMMARY, ORGANIZER, UID and RRULE. Content lines are unfolded
//! before parsing; date-times are interpreted as UTC (`...Z`), in a
//! `TZID` parameter zone, or as all-day dates.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcsError {
    #[error("payload contains no VEVENT")]
    NoEvent,
    #[error("VEVENT is missing {0}")]
    MissingProperty(&'static str),
    #[error("invalid {property} value `{value}`")]
    InvalidValue { property: &'static str, value: String },
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
}

/// The extracted event.
#[derive(Debug, Clone)]
pub struct IcsEvent {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub organizer: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Zone of the DTSTART, when declared via TZID.
    pub timezone: Option<String>,
    pub recurrence_rule: Option<String>,
}

/// Unfold RFC 5545 content lines: a CRLF (or LF) followed by a space or
/// tab continues the previous line.
fn unfold(payload: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in payload.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push_str(&raw[1..]);
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Split a content line into (name, params, value).
fn split_line(line: &str) -> Option<(String, Vec<(String, String)>, String)> {
    let (head, value) = line.split_once(':')?;
    let mut parts = head.split(';');
    let name = parts.next()?.to_ascii_uppercase();
    let params = parts
        .filter_map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
        })
        .collect();
    Some((name, params, value.to_string()))
}

fn parse_datetime(
    property: &'static str,
    value: &str,
    tzid: Option<&str>,
) -> Result<(DateTime<Utc>, Option<String>), IcsError> {
    let value = value.trim();

    // All-day form: VALUE=DATE or a bare 8-digit date.
    if value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| {
            IcsError::InvalidValue {
                property,
                value: value.to_string(),
            }
        })?;
        let midnight = date.and_hms_opt(0, 0, 0).ok_or(IcsError::InvalidValue {
            property,
            value: value.to_string(),
        })?;
        return Ok((Utc.from_utc_datetime(&midnight), None));
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").map_err(|_| {
            IcsError::InvalidValue {
                property,
                value: value.to_string(),
            }
        })?;
        return Ok((Utc.from_utc_datetime(&naive), None));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").map_err(|_| {
        IcsError::InvalidValue {
            property,
            value: value.to_string(),
        }
    })?;

    match tzid {
        Some(zone_name) => {
            let zone = Tz::from_str(zone_name)
                .map_err(|_| IcsError::UnknownTimezone(zone_name.to_string()))?;
            let local = zone
                .from_local_datetime(&naive)
                .earliest()
                .ok_or(IcsError::InvalidValue {
                    property,
                    value: value.to_string(),
                })?;
            Ok((local.with_timezone(&Utc), Some(zone_name.to_string())))
        }
        // Floating time; treat as UTC.
        None => Ok((Utc.from_utc_datetime(&naive), None)),
    }
}

/// Parse the first VEVENT in a calendar payload.
pub fn parse_event(payload: &str) -> Result<IcsEvent, IcsError> {
    let lines = unfold(payload);

    let mut in_event = false;
    let mut uid = None;
    let mut summary = None;
    let mut organizer = None;
    let mut rrule = None;
    let mut start: Option<(DateTime<Utc>, Option<String>)> = None;
    let mut end: Option<(DateTime<Utc>, Option<String>)> = None;

    for line in &lines {
        let Some((name, params, value)) = split_line(line) else {
            continue;
        };

        match name.as_str() {
            "BEGIN" if value.eq_ignore_ascii_case("VEVENT") => in_event = true,
            "END" if value.eq_ignore_ascii_case("VEVENT") => break,
            _ if !in_event => {}
            "UID" => uid = Some(value),
            "SUMMARY" => summary = Some(value),
            "ORGANIZER" => {
                let addr = value
                    .strip_prefix("mailto:")
                    .or_else(|| value.strip_prefix("MAILTO:"))
                    .unwrap_or(&value);
                organizer = Some(addr.to_lowercase());
            }
            "RRULE" => rrule = Some(value),
            "DTSTART" => {
                let tzid = params.iter().find(|(k, _)| k == "TZID").map(|(_, v)| v.as_str());
                start = Some(parse_datetime("DTSTART", &value, tzid)?);
            }
            "DTEND" => {
                let tzid = params.iter().find(|(k, _)| k == "TZID").map(|(_, v)| v.as_str());
                end = Some(parse_datetime("DTEND", &value, tzid)?);
            }
            _ => {}
        }
    }

    if !in_event {
        return Err(IcsError::NoEvent);
    }

    let (starts_at, start_zone) = start.ok_or(IcsError::MissingProperty("DTSTART"))?;
    let (ends_at, _) = end.ok_or(IcsError::MissingProperty("DTEND"))?;

    Ok(IcsEvent {
        uid,
        summary,
        organizer,
        starts_at,
        ends_at,
        timezone: start_zone,
        recurrence_rule: rrule,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:mw-2026-07@calendar.example\r\nSUMMARY:Network maintenance\r\n  core switches\r\nORGANIZER:mailto:Noc@Example.com\r\nDTSTART;TZID=Europe/Berlin:20260801T220000\r\nDTEND;TZID=Europe/Berlin:20260802T020000\r\nRRULE:FREQ=WEEKLY;BYDAY=SA\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    #[test]
    fn parses_a_zoned_event() {
        let event = parse_event(SAMPLE).expect("valid event");
        assert_eq!(event.uid.as_deref(), Some("mw-2026-07@calendar.example"));
        // The folded SUMMARY line is joined back together.
        assert_eq!(
            event.summary.as_deref(),
            Some("Network maintenance core switches")
        );
        assert_eq!(event.organizer.as_deref(), Some("noc@example.com"));
        assert_eq!(event.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(event.recurrence_rule.as_deref(), Some("FREQ=WEEKLY;BYDAY=SA"));
        // 22:00 Berlin in August is 20:00 UTC (CEST).
        assert_eq!(event.starts_at.to_rfc3339(), "2026-08-01T20:00:00+00:00");
        assert!(event.ends_at > event.starts_at);
    }

    #[test]
    fn parses_utc_timestamps() {
        let ics = "BEGIN:VEVENT\nDTSTART:20260801T100000Z\nDTEND:20260801T120000Z\nEND:VEVENT";
        let event = parse_event(ics).expect("valid event");
        assert_eq!(event.starts_at.to_rfc3339(), "2026-08-01T10:00:00+00:00");
        assert!(event.timezone.is_none());
    }

    #[test]
    fn missing_dtend_is_an_error() {
        let ics = "BEGIN:VEVENT\nDTSTART:20260801T100000Z\nEND:VEVENT";
        assert!(matches!(
            parse_event(ics),
            Err(IcsError::MissingProperty("DTEND"))
        ));
    }

    #[test]
    fn payload_without_event_is_an_error() {
        assert!(matches!(
            parse_event("BEGIN:VCALENDAR\nEND:VCALENDAR"),
            Err(IcsError::NoEvent)
        ));
    }

    #[test]
    fn unknown_timezone_is_an_error() {
        let ics = "BEGIN:VEVENT\nDTSTART;TZID=Mars/Olympus:20260801T100000\nDTEND:20260801T120000Z\nEND:VEVENT";
        assert!(matches!(parse_event(ics), Err(IcsError::UnknownTimezone(_))));
    }
}
