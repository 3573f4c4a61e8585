//! Filesystem drop-folder provider.
//!
//! A folder is a directory under the configured root; dropping an
//! `.eml` file into it "delivers" the message. UIDs are the 1-based
//! position in the lexicographically sorted file listing, which is
//! monotonic as long as delivered files are never removed. Intended for
//! drag-and-drop testing and local development.

use crate::ingest::provider::{FetchedMessage, MailProvider, ProviderError, parse_rfc822};
use std::path::PathBuf;
use std::time::Duration;

pub struct MaildirProvider {
    root: PathBuf,
    poll_interval: Duration,
}

impl MaildirProvider {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
        }
    }
}

#[rocket::async_trait]
impl MailProvider for MaildirProvider {
    async fn list(
        &self,
        folder: &str,
        since_uid: i64,
        limit: i64,
    ) -> Result<Vec<FetchedMessage>, ProviderError> {
        let dir = self.root.join(folder);
        if !dir.is_dir() {
            // A missing folder just has no mail yet.
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();

        let mut messages = Vec::new();
        for (index, name) in names.iter().enumerate() {
            let uid = index as i64 + 1;
            if uid <= since_uid {
                continue;
            }
            if messages.len() as i64 >= limit.max(0) {
                break;
            }

            let raw = tokio::fs::read(dir.join(name)).await?;
            messages.push(parse_rfc822(uid, &raw)?);
        }

        Ok(messages)
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIL: &str = "Message-ID: <m-SEQ@test>\r\nSubject: alert SEQ\r\nFrom: a@b.c\r\nDate: Mon, 20 Jul 2026 10:00:00 +0000\r\n\r\nbody SEQ\r\n";

    fn write_mail(dir: &std::path::Path, name: &str, seq: &str) {
        std::fs::write(dir.join(name), MAIL.replace("SEQ", seq)).unwrap();
    }

    #[tokio::test]
    async fn lists_in_order_with_stable_uids() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("INBOX");
        std::fs::create_dir_all(&folder).unwrap();
        write_mail(&folder, "001-first.eml", "1");
        write_mail(&folder, "002-second.eml", "2");
        write_mail(&folder, "003-third.eml", "3");

        let provider = MaildirProvider::new(tmp.path(), Duration::from_secs(1));

        let all = provider.list("INBOX", 0, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].uid, 1);
        assert_eq!(all[0].message_id, "m-1@test");

        // Resuming past UID 2 only returns the third message.
        let rest = provider.list("INBOX", 2, 100).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].uid, 3);
        assert_eq!(rest[0].subject, "alert 3");
    }

    #[tokio::test]
    async fn respects_batch_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("INBOX");
        std::fs::create_dir_all(&folder).unwrap();
        for i in 1..=5 {
            write_mail(&folder, &format!("{:03}.eml", i), &i.to_string());
        }

        let provider = MaildirProvider::new(tmp.path(), Duration::from_secs(1));
        let batch = provider.list("INBOX", 0, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.last().unwrap().uid, 2);
    }

    #[tokio::test]
    async fn missing_folder_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = MaildirProvider::new(tmp.path(), Duration::from_secs(1));
        assert!(provider.list("nope", 0, 10).await.unwrap().is_empty());
    }
}
