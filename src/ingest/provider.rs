//! Mail provider capability.
//!
//! A provider lists messages with folder-local, monotonically
//! increasing UIDs that are stable across reconnects; the ingester
//! never asks a provider to delete or mutate anything. RFC 5322
//! conversion is shared by the providers that hand back raw message
//! bytes.

use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, parse_mail};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One message as listed by a provider.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Folder-local monotonic UID.
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub date: Option<DateTime<Utc>>,
    /// Case-folded header map.
    pub headers: Value,
    pub body_text: String,
    pub body_html: Option<String>,
    /// Raw text/calendar part, when present.
    pub ics: Option<String>,
    /// Attachment metadata: `[{filename, content_type, size}]`.
    pub attachments: Value,
}

#[rocket::async_trait]
pub trait MailProvider: Send + Sync {
    /// Messages with UID > `since_uid`, in UID order, at most `limit`.
    async fn list(
        &self,
        folder: &str,
        since_uid: i64,
        limit: i64,
    ) -> Result<Vec<FetchedMessage>, ProviderError>;

    /// How often the folder should be polled.
    fn poll_interval(&self) -> Duration;
}

fn sanitize(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

/// Convert raw RFC 5322 bytes into a `FetchedMessage` (UID supplied by
/// the caller). Tolerant: a missing header yields an empty field, never
/// an error, since raw mail must be stored before it can be judged.
pub fn parse_rfc822(uid: i64, raw: &[u8]) -> Result<FetchedMessage, ProviderError> {
    let parsed = parse_mail(raw).map_err(|e| ProviderError::Protocol(e.to_string()))?;

    let mut headers = Map::new();
    for header in &parsed.headers {
        headers.insert(
            header.get_key().to_lowercase(),
            Value::String(sanitize(&header.get_value())),
        );
    }

    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|id| sanitize(id.trim_matches(&['<', '>'][..])))
        .unwrap_or_default();

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize(&s))
        .unwrap_or_default();

    let from_addr = parsed
        .headers
        .get_first_value("From")
        .and_then(|raw_from| {
            mailparse::addrparse(&raw_from).ok().and_then(|addrs| {
                addrs.iter().next().and_then(|addr| match addr {
                    mailparse::MailAddr::Single(info) => Some(info.addr.to_lowercase()),
                    _ => None,
                })
            })
        })
        .unwrap_or_default();

    let to_addrs = parsed
        .headers
        .get_first_value("To")
        .map(|raw_to| {
            raw_to
                .split(',')
                .filter_map(|part| {
                    mailparse::addrparse(part.trim()).ok().and_then(|addrs| {
                        addrs.iter().next().and_then(|addr| match addr {
                            mailparse::MailAddr::Single(info) => Some(info.addr.to_lowercase()),
                            _ => None,
                        })
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let date = parsed
        .headers
        .get_first_value("Date")
        .and_then(|raw_date| dateparser::parse(&raw_date).ok())
        .map(|dt| dt.with_timezone(&Utc));

    // Walk the MIME tree once for text, HTML, calendar and attachment
    // parts.
    let mut body_text = String::new();
    let mut body_html = None;
    let mut ics = None;
    let mut attachments = Vec::new();
    collect_parts(
        &parsed,
        &mut body_text,
        &mut body_html,
        &mut ics,
        &mut attachments,
    );

    if body_text.is_empty() && parsed.subparts.is_empty() {
        body_text = parsed.get_body().unwrap_or_default();
    }

    Ok(FetchedMessage {
        uid,
        message_id,
        subject,
        from_addr,
        to_addrs,
        date,
        headers: Value::Object(headers),
        body_text: sanitize(&body_text),
        body_html,
        ics,
        attachments: Value::Array(attachments),
    })
}

fn collect_parts(
    part: &mailparse::ParsedMail<'_>,
    body_text: &mut String,
    body_html: &mut Option<String>,
    ics: &mut Option<String>,
    attachments: &mut Vec<Value>,
) {
    let mimetype = part.ctype.mimetype.to_lowercase();

    if let Some(filename) = part.get_content_disposition().params.get("filename") {
        attachments.push(serde_json::json!({
            "filename": filename,
            "content_type": mimetype,
            "size": part.get_body_raw().map(|b| b.len()).unwrap_or(0),
        }));
        if mimetype == "text/calendar" && ics.is_none() {
            *ics = part.get_body().ok();
        }
    } else {
        match mimetype.as_str() {
            "text/plain" if body_text.is_empty() => {
                *body_text = part.get_body().unwrap_or_default();
            }
            "text/html" if body_html.is_none() => {
                *body_html = part.get_body().ok();
            }
            "text/calendar" if ics.is_none() => {
                *ics = part.get_body().ok();
            }
            _ => {}
        }
    }

    for sub in &part.subparts {
        collect_parts(sub, body_text, body_html, ics, attachments);
    }
}
