//! Pipeline wiring and background scheduling.
//!
//! One ingester task per configured folder feeds a bounded in-process
//! queue drained by parser workers; each worker runs maintenance
//! matching and correlation inline for the events it produces. Periodic
//! sweepers (auto-resolve, DLQ retry, idempotency expiry, maintenance
//! tick, pending reprocess) run as cooperative tasks. A single
//! cancellation token coordinates shutdown: every task finishes its
//! current step, commits, and exits.

use crate::config::{NgsConfig, ProviderKind};
use crate::correlate::sweeper::ResolveSweeper;
use crate::correlate::{CorrelationOutcome, Correlator, LogNotificationSink, NotificationSink};
use crate::ingest::graph::GraphProvider;
use crate::ingest::imap::ImapProvider;
use crate::ingest::maildir::MaildirProvider;
use crate::ingest::provider::MailProvider;
use crate::ingest::Ingester;
use crate::maintenance::scope::ScopeTarget;
use crate::maintenance::{MaintenanceEngine, SuppressionDecision};
use crate::models::{DeadLetterEntry, ParseStatus, SuppressMode};
use crate::parse::llm::{AlertExtractor, LlmClient};
use crate::parse::rules::RuleSet;
use crate::parse::{ParseDisposition, ParseError, Parser};
use crate::store::events::NewAlertEvent;
use crate::store::{
    AlertEventStore, CursorStore, DeadLetterStore, IdempotencyStore, IncidentStore,
    PatternCacheStore, QuarantineStore, RawEmailStore,
};
use chrono::Utc;
use rocket_db_pools::sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handler key for parse steps parked in the dead-letter queue.
const DLQ_PARSE_EMAIL: &str = "parse_email";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to build LLM client: {0}")]
    Llm(#[from] crate::parse::llm::LlmError),
    #[error("failed to build mail provider: {0}")]
    Provider(#[from] crate::ingest::provider::ProviderError),
}

/// All pipeline services, shared by workers and the HTTP surface.
pub struct Pipeline {
    pub config: NgsConfig,
    pub raw_emails: RawEmailStore,
    pub events: AlertEventStore,
    pub incidents: IncidentStore,
    pub cursors: CursorStore,
    pub quarantine: QuarantineStore,
    pub dlq: DeadLetterStore,
    pub idempotency: IdempotencyStore,
    pub maintenance: Arc<MaintenanceEngine>,
    pub correlator: Correlator,
    parser: Parser,
    ingester: Ingester,
}

impl Pipeline {
    /// Build the full pipeline with the HTTP-backed LLM client and the
    /// configured mail provider.
    pub fn new(pool: PgPool, config: NgsConfig) -> Result<Arc<Self>, PipelineError> {
        let extractor: Arc<dyn AlertExtractor> = Arc::new(LlmClient::new(config.llm.clone())?);
        let provider = build_provider(&config)?;
        let sink: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink);
        Ok(Self::assemble(pool, config, extractor, provider, sink))
    }

    /// Build with injected collaborators; integration tests script the
    /// extractor and deliver mail through a temp drop folder.
    pub fn assemble(
        pool: PgPool,
        config: NgsConfig,
        extractor: Arc<dyn AlertExtractor>,
        provider: Arc<dyn MailProvider>,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let raw_emails = RawEmailStore::new(pool.clone());
        let events = AlertEventStore::new(pool.clone());
        let incidents = IncidentStore::new(pool.clone());
        let cursors = CursorStore::new(pool.clone());
        let quarantine = QuarantineStore::new(pool.clone());
        let dlq = DeadLetterStore::new(pool.clone(), config.dlq.clone());
        let idempotency = IdempotencyStore::new(pool.clone(), config.idempotency.clone());
        let maintenance = Arc::new(MaintenanceEngine::new(
            pool.clone(),
            config.maintenance.clone(),
        ));
        let cache = PatternCacheStore::new(pool.clone());

        let parser = Parser::new(
            RuleSet::compile(&config.rules),
            config.parser.clone(),
            config.llm.clone(),
            config.maintenance.clone(),
            raw_emails.clone(),
            cache,
            quarantine.clone(),
            idempotency.clone(),
            maintenance.clone(),
            extractor,
        );

        let correlator = Correlator::new(pool.clone(), config.correlation.clone(), sink.clone());

        let ingester = Ingester::new(
            provider,
            cursors.clone(),
            raw_emails.clone(),
            idempotency.clone(),
            config.ingest.batch_size,
        );

        Arc::new(Self {
            config,
            raw_emails,
            events,
            incidents,
            cursors,
            quarantine,
            dlq,
            idempotency,
            maintenance,
            correlator,
            parser,
            ingester,
        })
    }

    /// One manual poll pass over a folder, bypassing the scheduler.
    pub async fn poll_once(
        &self,
        folder: &str,
        parse_tx: &mpsc::Sender<Uuid>,
    ) -> Result<crate::ingest::PollStats, crate::ingest::IngestError> {
        self.ingester.poll(folder, parse_tx).await
    }

    /// Spawn all background tasks. The returned handles complete once
    /// `shutdown` is cancelled.
    pub fn spawn(self: &Arc<Self>, pool: PgPool, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let (parse_tx, parse_rx) = mpsc::channel::<Uuid>(self.config.ingest.parse_queue_capacity);
        let parse_rx = Arc::new(Mutex::new(parse_rx));

        let mut handles = Vec::new();

        // One ingester loop per folder.
        for folder in self.config.ingest.folders.clone() {
            let pipeline = Arc::clone(self);
            let tx = parse_tx.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pipeline.ingest_loop(folder, tx, token).await;
            }));
        }

        // Parser worker pool.
        for worker in 0..self.config.ingest.parse_workers.max(1) {
            let pipeline = Arc::clone(self);
            let rx = Arc::clone(&parse_rx);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pipeline.parse_worker_loop(worker, rx, token).await;
            }));
        }

        // Auto-resolve + quiet-period sweeper.
        {
            let sweeper = Arc::new(ResolveSweeper::new(
                pool.clone(),
                self.config.correlation.clone(),
                Arc::new(LogNotificationSink),
            ));
            let interval = self.config.correlation.sweep_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_periodic("auto-resolve", interval, token, move || {
                    let sweeper = Arc::clone(&sweeper);
                    async move {
                        sweeper.sweep().await.map(|n| {
                            if n > 0 {
                                log::info!("auto-resolve sweep resolved {} incidents", n);
                            }
                        })
                    }
                })
                .await;
            }));
        }

        // Dead-letter retry sweeper.
        {
            let pipeline = Arc::clone(self);
            let interval = self.config.dlq.sweep_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_periodic("dlq-retry", interval, token, move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move { pipeline.dlq_sweep().await }
                })
                .await;
            }));
        }

        // Idempotency key expiry.
        {
            let pipeline = Arc::clone(self);
            let interval = self.config.idempotency.cleanup_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_periodic("idempotency-expiry", interval, token, move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move {
                        pipeline.idempotency.purge_expired().await.map(|n| {
                            if n > 0 {
                                log::debug!("purged {} expired idempotency keys", n);
                            }
                        })
                    }
                })
                .await;
            }));
        }

        // Maintenance evaluation tick.
        {
            let pipeline = Arc::clone(self);
            let interval = self.config.maintenance.tick_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_periodic("maintenance-tick", interval, token, move || {
                    let pipeline = Arc::clone(&pipeline);
                    async move {
                        pipeline
                            .maintenance
                            .tick(&pipeline.incidents)
                            .await
                            .map(|_| ())
                    }
                })
                .await;
            }));
        }

        // Reprocess sweeper: raw emails stuck in `pending` after a
        // mid-pipeline crash are re-enqueued.
        {
            let pipeline = Arc::clone(self);
            let tx = parse_tx.clone();
            let interval = self.config.ingest.reprocess_interval;
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_periodic("reprocess-pending", interval, token, move || {
                    let pipeline = Arc::clone(&pipeline);
                    let tx = tx.clone();
                    async move { pipeline.reprocess_pending(&tx).await }
                })
                .await;
            }));
        }

        handles
    }

    async fn ingest_loop(
        &self,
        folder: String,
        parse_tx: mpsc::Sender<Uuid>,
        shutdown: CancellationToken,
    ) {
        log::info!("ingester for folder `{}` started", folder);
        let base_interval = self.ingester.poll_interval();
        let mut error_streak: u32 = 0;

        loop {
            let wait = if error_streak == 0 {
                base_interval
            } else {
                // Exponential backoff on provider failures, capped.
                let factor = 2u32.saturating_pow(error_streak.min(6));
                (base_interval * factor).min(Duration::from_secs(900))
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.ingester.poll(&folder, &parse_tx).await {
                Ok(_) => error_streak = 0,
                Err(e) => {
                    error_streak = error_streak.saturating_add(1);
                    log::warn!("ingest {}: {}", folder, e);
                }
            }
        }

        log::info!("ingester for folder `{}` stopped", folder);
    }

    async fn parse_worker_loop(
        &self,
        worker: usize,
        parse_rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
        shutdown: CancellationToken,
    ) {
        log::info!("parse worker {} started", worker);

        loop {
            let raw_email_id = {
                let mut rx = parse_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(id) => id,
                        None => break,
                    },
                }
            };

            self.handle_email(raw_email_id).await;
        }

        log::info!("parse worker {} stopped", worker);
    }

    /// Drive one raw email through parse, maintenance matching and
    /// correlation. Errors are routed per the error taxonomy: transient
    /// failures go to the DLQ, data failures already reached a terminal
    /// parse status.
    pub async fn handle_email(&self, raw_email_id: Uuid) {
        match self.process_email(raw_email_id).await {
            Ok(()) => {}
            Err(ParseError::Transient(reason)) => {
                let payload = serde_json::json!({ "raw_email_id": raw_email_id });
                if let Err(e) = self.dlq.push(DLQ_PARSE_EMAIL, payload, &reason).await {
                    log::error!("failed to dead-letter email {}: {}", raw_email_id, e);
                }
            }
            Err(ParseError::MissingEmail(id)) => {
                log::error!("raw email {} vanished before parsing", id);
            }
            Err(ParseError::Database(e)) => {
                let payload = serde_json::json!({ "raw_email_id": raw_email_id });
                if let Err(push_err) = self
                    .dlq
                    .push(DLQ_PARSE_EMAIL, payload, &e.to_string())
                    .await
                {
                    log::error!(
                        "failed to dead-letter email {} after {}: {}",
                        raw_email_id,
                        e,
                        push_err
                    );
                }
            }
        }
    }

    async fn process_email(&self, raw_email_id: Uuid) -> Result<(), ParseError> {
        match self.parser.process(raw_email_id).await? {
            ParseDisposition::Alert(event, _) => {
                self.correlate_event(raw_email_id, *event).await?;
            }
            ParseDisposition::Maintenance(window) => {
                log::info!(
                    "email {} declared maintenance window {}",
                    raw_email_id,
                    window.id
                );
            }
            ParseDisposition::Quarantined { reason } => {
                log::info!("email {} quarantined: {}", raw_email_id, reason);
            }
            ParseDisposition::Failed { reason } => {
                log::warn!("email {} failed to parse: {}", raw_email_id, reason);
            }
            ParseDisposition::AlreadyParsed => {}
        }
        Ok(())
    }

    async fn correlate_event(
        &self,
        raw_email_id: Uuid,
        mut event: NewAlertEvent,
    ) -> Result<(), ParseError> {
        let decision = {
            let target = ScopeTarget {
                host: &event.host,
                service: &event.service,
                env: &event.environment,
                region: &event.region,
                tags: &event.tags,
            };
            self.maintenance.evaluate(&target).await?
        };

        if let Some(decision) = &decision {
            apply_suppression(&mut event, decision);
        }

        let stored = self.events.insert(&event).await?;
        self.raw_emails
            .set_parse_status(raw_email_id, ParseStatus::Parsed, None)
            .await?;

        let outcome = self.correlator.ingest(&stored).await?;

        if let Some(decision) = decision {
            let incident_id = match outcome {
                CorrelationOutcome::Created { incident_id }
                | CorrelationOutcome::Linked { incident_id, .. } => Some(incident_id),
                CorrelationOutcome::Dropped => None,
            };
            self.maintenance
                .record_matches(&decision, incident_id, Some(stored.id))
                .await?;
        }

        Ok(())
    }

    /// One DLQ sweep: claim due entries and re-dispatch them to their
    /// originating handler.
    pub async fn dlq_sweep(&self) -> Result<(), sqlx::Error> {
        let entries = self.dlq.claim_due(20).await?;

        for entry in entries {
            match self.dispatch_dead_letter(&entry).await {
                Ok(()) => self.dlq.mark_resolved(entry.id).await?,
                Err(reason) => self.dlq.mark_retry_failed(&entry, &reason).await?,
            }
        }

        Ok(())
    }

    async fn dispatch_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), String> {
        match entry.event_type.as_str() {
            DLQ_PARSE_EMAIL => {
                let raw_email_id = entry
                    .payload
                    .get("raw_email_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| "payload missing raw_email_id".to_string())?;

                match self.process_email(raw_email_id).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            other => Err(format!("no handler registered for `{}`", other)),
        }
    }

    async fn reprocess_pending(&self, parse_tx: &mpsc::Sender<Uuid>) -> Result<(), sqlx::Error> {
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.ingest.reprocess_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.raw_emails.stale_pending(threshold, 100).await?;

        for id in stale {
            log::info!("re-enqueueing stale pending email {}", id);
            if parse_tx.send(id).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

/// Apply a suppression decision to an event before insertion.
fn apply_suppression(event: &mut NewAlertEvent, decision: &SuppressionDecision) {
    if let Some(payload) = event.payload.as_object_mut() {
        payload.insert(
            "maintenance_window_id".to_string(),
            serde_json::Value::String(decision.window_id.to_string()),
        );
    }

    match decision.mode {
        SuppressMode::Mute => {
            event.is_suppressed = true;
            event.suppression_reason = Some("maintenance_mute".to_string());
        }
        SuppressMode::Digest => {
            event.is_suppressed = true;
            event.suppression_reason = Some("maintenance_digest".to_string());
            if let Some(payload) = event.payload.as_object_mut() {
                payload.insert("digest".to_string(), serde_json::Value::Bool(true));
            }
        }
        SuppressMode::Downgrade => {
            let original = event.severity;
            event.severity = original.downgraded();
            if let Some(payload) = event.payload.as_object_mut() {
                payload.insert(
                    "original_severity".to_string(),
                    serde_json::Value::String(original.as_str().to_string()),
                );
            }
            // The content hash covers severity; recompute after the
            // downgrade so dedup compares like with like.
            event.content_hash = crate::fingerprint::content_hash(
                &event.fingerprint,
                event.severity,
                event.state,
                &event.normalized_signature,
            );
        }
    }
}

fn build_provider(config: &NgsConfig) -> Result<Arc<dyn MailProvider>, PipelineError> {
    let interval = config.ingest.poll_interval;
    let provider: Arc<dyn MailProvider> = match config.ingest.provider {
        ProviderKind::Imap => Arc::new(ImapProvider::new(config.ingest.imap.clone(), interval)),
        ProviderKind::Graph => {
            Arc::new(GraphProvider::new(config.ingest.graph.clone(), interval)?)
        }
        ProviderKind::Maildir => Arc::new(MaildirProvider::new(
            config.ingest.maildir_root.clone(),
            interval,
        )),
    };
    Ok(provider)
}

/// Run a cancellable periodic task. Errors are logged, never fatal; no
/// tick overlaps the previous one.
async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    mut step: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
{
    log::info!("{} sweeper started (every {:?})", name, interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = step().await {
            log::error!("{} sweep failed: {}", name, e);
        }
    }

    log::info!("{} sweeper stopped", name);
}
