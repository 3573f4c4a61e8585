//! Microsoft Graph mail provider.
//!
//! Graph has no integer UIDs, so the provider maps the folder's
//! position ordered by `receivedDateTime` onto the UID sequence:
//! message N in that ordering has UID N. Folders are treated as
//! append-only alert drops, which keeps the mapping stable across
//! reconnects.

use crate::config::GraphSettings;
use crate::ingest::provider::{FetchedMessage, MailProvider, ProviderError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

pub struct GraphProvider {
    settings: GraphSettings,
    http: reqwest::Client,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct GraphMessageList {
    value: Vec<GraphMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    body: Option<GraphBody>,
    #[serde(default)]
    body_preview: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

impl GraphProvider {
    pub fn new(settings: GraphSettings, poll_interval: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("ngs-ingest/0.1")
            .build()?;

        Ok(Self {
            settings,
            http,
            poll_interval,
        })
    }

    fn recipient_addr(recipient: &GraphRecipient) -> Option<String> {
        recipient
            .email_address
            .as_ref()
            .and_then(|e| e.address.as_ref())
            .map(|a| a.to_lowercase())
    }
}

#[rocket::async_trait]
impl MailProvider for GraphProvider {
    async fn list(
        &self,
        folder: &str,
        since_uid: i64,
        limit: i64,
    ) -> Result<Vec<FetchedMessage>, ProviderError> {
        let url = format!(
            "{}/users/{}/mailFolders/{}/messages",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.mailbox,
            folder
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.settings.access_token)
            .query(&[
                ("$orderby", "receivedDateTime asc".to_string()),
                ("$skip", since_uid.max(0).to_string()),
                ("$top", limit.max(0).to_string()),
                (
                    "$select",
                    "internetMessageId,subject,from,toRecipients,receivedDateTime,body,bodyPreview"
                        .to_string(),
                ),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Protocol(format!(
                "graph returned {status}: {body}"
            )));
        }

        let list: GraphMessageList = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("graph response malformed: {e}")))?;

        let messages = list
            .value
            .into_iter()
            .enumerate()
            .map(|(index, message)| {
                let uid = since_uid + index as i64 + 1;

                let (body_text, body_html) = match message.body {
                    Some(GraphBody {
                        content_type: Some(kind),
                        content: Some(content),
                    }) if kind.eq_ignore_ascii_case("html") => {
                        (message.body_preview.unwrap_or_default(), Some(content))
                    }
                    Some(GraphBody {
                        content: Some(content),
                        ..
                    }) => (content, None),
                    _ => (message.body_preview.unwrap_or_default(), None),
                };

                FetchedMessage {
                    uid,
                    message_id: message
                        .internet_message_id
                        .map(|id| id.trim_matches(&['<', '>'][..]).to_string())
                        .unwrap_or_default(),
                    subject: message.subject.unwrap_or_default(),
                    from_addr: message
                        .from
                        .as_ref()
                        .and_then(Self::recipient_addr)
                        .unwrap_or_default(),
                    to_addrs: message
                        .to_recipients
                        .iter()
                        .filter_map(Self::recipient_addr)
                        .collect(),
                    date: message.received_date_time,
                    headers: Value::Object(Map::new()),
                    body_text,
                    body_html,
                    ics: None,
                    attachments: Value::Array(Vec::new()),
                }
            })
            .collect();

        Ok(messages)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
