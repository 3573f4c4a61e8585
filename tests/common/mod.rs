//! Shared harness for integration tests: a disposable Postgres, a temp
//! drop folder as the mail source, and a scripted LLM extractor.

use ngs_server::config::{
    CorrelationConfig, DlqConfig, GraphSettings, IdempotencyConfig, ImapSettings, IngestConfig,
    LlmConfig, MaintenanceConfig, NgsConfig, ParserConfig, ProviderKind, default_rules,
};
use ngs_server::correlate::LogNotificationSink;
use ngs_server::ingest::maildir::MaildirProvider;
use ngs_server::parse::llm::{AlertExtractor, LlmError, LlmExtraction};
use ngs_server::pipeline::Pipeline;
use ngs_server::test_support::{TestDatabase, TestDatabaseError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Extractor fed from a queue of canned responses; calls beyond the
/// script fail like a dead endpoint.
pub struct ScriptedExtractor {
    responses: Mutex<VecDeque<LlmExtraction>>,
    pub calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(responses: Vec<LlmExtraction>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[rocket::async_trait]
impl AlertExtractor for ScriptedExtractor {
    async fn extract(&self, _subject: &str, _body: &str) -> Result<LlmExtraction, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or(LlmError::Capacity)
    }
}

pub struct Harness {
    pub db: TestDatabase,
    pub pipeline: Arc<Pipeline>,
    pub extractor: Arc<ScriptedExtractor>,
    pub mail_root: tempfile::TempDir,
    pub parse_tx: mpsc::Sender<Uuid>,
    pub parse_rx: mpsc::Receiver<Uuid>,
    seq: usize,
}

/// Configuration tuned for deterministic tests: zero quiet period, a
/// one-hour auto-resolve horizon, immediate idempotency reclaim off.
pub fn test_config(maildir_root: &std::path::Path) -> NgsConfig {
    NgsConfig {
        rules: default_rules(),
        parser: ParserConfig {
            cache_min_success: 70.0,
            quarantine_confidence_threshold: 0.60,
        },
        correlation: CorrelationConfig {
            dedup_window: Duration::from_secs(15 * 60),
            flap_threshold: 5,
            flap_window: Duration::from_secs(30 * 60),
            resolve_quiet_period: Duration::from_secs(0),
            auto_resolve_after: Duration::from_secs(3600),
            single_open_per_fingerprint: true,
            sweep_interval: Duration::from_secs(300),
        },
        maintenance: MaintenanceConfig {
            subject_prefixes: vec!["[MW]".to_string(), "Maintenance:".to_string()],
            tick_interval: Duration::from_secs(60),
            window_cache_ttl: Duration::from_secs(0),
        },
        llm: LlmConfig {
            endpoint: "http://localhost:0/unused".to_string(),
            model: "test".to_string(),
            min_confidence: 0.60,
            request_timeout: Duration::from_secs(15),
            requests_per_minute: 60,
            max_in_flight: 4,
            body_excerpt_bytes: 8192,
        },
        dlq: DlqConfig {
            base_backoff: Duration::from_secs(30),
            cap_backoff: Duration::from_secs(3600),
            max_retries: 3,
            sweep_interval: Duration::from_secs(60),
        },
        idempotency: IdempotencyConfig {
            ttl: Duration::from_secs(24 * 3600),
            stale_after: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
        },
        ingest: IngestConfig {
            provider: ProviderKind::Maildir,
            folders: vec!["INBOX".to_string()],
            batch_size: 100,
            reprocess_after: Duration::from_secs(600),
            reprocess_interval: Duration::from_secs(120),
            parse_workers: 1,
            parse_queue_capacity: 64,
            poll_interval: Duration::from_secs(60),
            imap: ImapSettings {
                host: String::new(),
                port: 993,
                username: String::new(),
                password: String::new(),
            },
            graph: GraphSettings {
                base_url: String::new(),
                access_token: String::new(),
                mailbox: String::new(),
            },
            maildir_root: maildir_root.display().to_string(),
        },
    }
}

impl Harness {
    /// `None` when no container runtime is available.
    pub async fn new(responses: Vec<LlmExtraction>) -> Option<Harness> {
        let db = match TestDatabase::new_from_env().await {
            Ok(db) => db,
            Err(TestDatabaseError::Container(err)) => {
                eprintln!("skipping test: no container runtime ({err})");
                return None;
            }
            Err(err) => panic!("failed to provision test database: {err:?}"),
        };

        let mail_root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(mail_root.path().join("INBOX")).expect("mail folder");

        let config = test_config(mail_root.path());
        let extractor = Arc::new(ScriptedExtractor::new(responses));
        let provider = Arc::new(MaildirProvider::new(
            mail_root.path(),
            Duration::from_secs(60),
        ));

        let pipeline = Pipeline::assemble(
            db.pool_clone(),
            config,
            extractor.clone(),
            provider,
            Arc::new(LogNotificationSink),
        );

        let (parse_tx, parse_rx) = mpsc::channel(64);

        Some(Harness {
            db,
            pipeline,
            extractor,
            mail_root,
            parse_tx,
            parse_rx,
            seq: 0,
        })
    }

    /// Drop an RFC 5322 message into the INBOX folder.
    pub fn deliver(&mut self, raw: &str) {
        self.seq += 1;
        let path = self
            .mail_root
            .path()
            .join("INBOX")
            .join(format!("{:05}.eml", self.seq));
        std::fs::write(path, raw).expect("write mail");
    }

    /// Poll the folder once and run every newly stored email through
    /// the pipeline.
    pub async fn run_pipeline(&mut self) {
        self.pipeline
            .poll_once("INBOX", &self.parse_tx)
            .await
            .expect("poll succeeds");

        while let Ok(raw_email_id) = self.parse_rx.try_recv() {
            self.pipeline.handle_email(raw_email_id).await;
        }
    }

    pub fn pool(&self) -> sqlx::PgPool {
        self.db.pool_clone()
    }
}

/// A Nagios-style alert message.
pub fn nagios_mail(message_id: &str, host: &str, service: &str, state: &str, level: &str) -> String {
    let verb = if state == "PROBLEM" { "PROBLEM" } else { "RECOVERY" };
    format!(
        "Message-ID: <{message_id}>\r\n\
         Subject: ** {verb} ** Host: {host} Service: {service} State: {level}\r\n\
         From: Nagios <nagios@monitoring.example.com>\r\n\
         To: oncall@example.com\r\n\
         Date: Mon, 20 Jul 2026 10:00:00 +0000\r\n\
         \r\n\
         Host: {host}\r\nService: {service}\r\nState: {level}\r\nenv=prod\r\n"
    )
}
