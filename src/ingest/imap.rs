//! IMAP mail provider over implicit TLS.
//!
//! A fresh session is opened per poll; the UID SEARCH + UID FETCH pair
//! keeps the provider stateless between polls, with the folder cursor
//! carrying all resume state.

use crate::config::ImapSettings;
use crate::ingest::provider::{FetchedMessage, MailProvider, ProviderError, parse_rfc822};
use async_native_tls::TlsConnector;
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;

pub struct ImapProvider {
    settings: ImapSettings,
    poll_interval: Duration,
}

impl ImapProvider {
    pub fn new(settings: ImapSettings, poll_interval: Duration) -> Self {
        Self {
            settings,
            poll_interval,
        }
    }
}

#[rocket::async_trait]
impl MailProvider for ImapProvider {
    async fn list(
        &self,
        folder: &str,
        since_uid: i64,
        limit: i64,
    ) -> Result<Vec<FetchedMessage>, ProviderError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProviderError::Connect(format!("{addr}: {e}")))?;

        let tls = TlsConnector::new();
        let tls_stream = tls
            .connect(&self.settings.host, tcp)
            .await
            .map_err(|e| ProviderError::Connect(format!("TLS handshake failed: {e}")))?;

        // async-imap is built with its tokio runtime feature, so it speaks
        // tokio's AsyncRead/AsyncWrite directly; no adapter is needed.
        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&self.settings.username, &self.settings.password)
            .await
            .map_err(|e| ProviderError::Connect(format!("login failed: {:?}", e.0)))?;

        session
            .select(folder)
            .await
            .map_err(|e| ProviderError::Protocol(format!("select {folder}: {e}")))?;

        // UIDs are u32 on the wire; the cursor is wider for the other
        // providers.
        let since = u32::try_from(since_uid.max(0)).unwrap_or(u32::MAX);
        let query = format!("UID {}:*", since.saturating_add(1));
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| ProviderError::Protocol(format!("uid search: {e}")))?;

        let mut wanted: Vec<u32> = uids
            .into_iter()
            .filter(|uid| i64::from(*uid) > since_uid)
            .collect();
        wanted.sort_unstable();
        wanted.truncate(limit.max(0) as usize);

        let mut messages = Vec::with_capacity(wanted.len());
        for uid in wanted {
            let mut stream = session
                .uid_fetch(uid.to_string(), "(UID RFC822)")
                .await
                .map_err(|e| ProviderError::Protocol(format!("uid fetch {uid}: {e}")))?;

            while let Some(fetch) = stream.next().await {
                let fetch =
                    fetch.map_err(|e| ProviderError::Protocol(format!("fetch {uid}: {e}")))?;
                let Some(body) = fetch.body() else {
                    continue;
                };
                let uid = fetch.uid.map(i64::from).unwrap_or(i64::from(uid));
                messages.push(parse_rfc822(uid, body)?);
            }
        }

        session.logout().await.ok();

        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
