//! Pipeline orchestration.
//!
//! The [`Pipeline`] drives each document through
//! `PENDING → FETCHED → CONVERTED → OCR_DONE → ASSEMBLED → INDEXED`, or to
//! `FAILED` with a detail naming the stage and cause. State is never kept
//! in memory between stages: before every stage the driver re-derives the
//! document's custody from the ledger and runs the first incomplete stage,
//! so a restart resumes exactly where the last committed event left off.
//!
//! # Stage execution
//!
//! Each stage runs under its own timeout and the shared cancellation token.
//! Components retry their own transient failures; the driver additionally
//! re-runs a whole stage when it timed out or its ledger append did not
//! commit. A re-run first checks the ledger, so a stage whose event did
//! commit is never executed twice.
//!
//! # Failure classes
//!
//! - **Permanent** (404, corrupt PDF, OCR retries spent): a `FAILED` event
//!   is appended and the document stops. `redrive` requeues it.
//! - **Fatal** (ledger append exhausted, broken hash chain, store
//!   corruption): the pipeline halts, in-flight work is cancelled, and new
//!   work is refused with [`PipelineError::Halted`].
//!
//! # Concurrency
//!
//! [`Pipeline::run_all`] runs one tokio task per document, bounded by a
//! semaphore of `workers` permits. A per-document lease keeps two workers
//! off the same document.

use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::assemble::{assemble, PageInput, PagePolicy};
use crate::config::Config;
use crate::content_store::ContentStore;
use crate::convert::{ConvertEngine, Converter};
use crate::error::{LedgerError, PipelineError};
use crate::fetch::{Fetcher, SourceTransport, Transport};
use crate::indexer::Indexer;
use crate::lease::{LeaseGuard, LeaseManager};
use crate::ledger::{Custody, Ledger};
use crate::models::{document_id_for, EventStatus, NewEvent, PipelineState, Stage};
use crate::ocr::{OcrAdapter, OcrEngine, TesseractEngine};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::retry::RetryPolicy;

/// Where a document stands after the driver let go of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub state: PipelineState,
    /// `"<stage>: <cause>"` for failed documents, or the reason the driver
    /// could not run.
    pub error_detail: Option<String>,
}

impl DocumentReport {
    pub fn is_ok(&self) -> bool {
        self.state != PipelineState::Failed && self.error_detail.is_none()
    }
}

/// Outcome of [`Pipeline::rebuild_index`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebuildReport {
    pub documents: u64,
    pub events_replayed: u64,
}

/// Assembles a [`Pipeline`], with engine overrides for tests and
/// alternative deployments.
pub struct PipelineBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    convert_engines: Option<Vec<Arc<dyn ConvertEngine>>>,
    ocr_engine: Option<Arc<dyn OcrEngine>>,
    progress: Arc<dyn ProgressReporter>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            convert_engines: None,
            ocr_engine: None,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn convert_engines(mut self, engines: Vec<Arc<dyn ConvertEngine>>) -> Self {
        self.convert_engines = Some(engines);
        self
    }

    pub fn ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr_engine = Some(engine);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        let retry = RetryPolicy::from_config(&config.pipeline);
        let threshold = config.pipeline.low_confidence_threshold;

        let store = Arc::new(ContentStore::open(config.objects_dir())?);
        let ledger = Arc::new(Ledger::open(&config.ledger_path()).await?);
        let indexer = Indexer::open(
            &config.index_path(),
            ledger.clone(),
            store.clone(),
            threshold,
            retry,
        )
        .await?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(SourceTransport::new(&config)?),
        };
        let engines = self
            .convert_engines
            .unwrap_or_else(|| Converter::default_engines(&config.converter));
        let ocr_engine: Arc<dyn OcrEngine> = match self.ocr_engine {
            Some(e) => e,
            None => Arc::new(TesseractEngine::new(&config.ocr)),
        };

        Ok(Pipeline {
            fetcher: Fetcher::new(transport, store.clone(), ledger.clone(), retry),
            converter: Converter::new(engines, store.clone(), ledger.clone(), retry),
            ocr: OcrAdapter::new(ocr_engine, store.clone(), retry, threshold),
            leases: LeaseManager::new(config.pipeline.lease_ttl()),
            indexer,
            ledger,
            store,
            retry,
            progress: self.progress,
            halted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            config,
        })
    }
}

enum Job {
    Ingest(String),
    Drive(String),
}

pub struct Pipeline {
    config: Config,
    ledger: Arc<Ledger>,
    store: Arc<ContentStore>,
    fetcher: Fetcher,
    converter: Converter,
    ocr: OcrAdapter,
    indexer: Indexer,
    leases: Arc<LeaseManager>,
    retry: RetryPolicy,
    progress: Arc<dyn ProgressReporter>,
    halted: AtomicBool,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Open the vault under `config.vault.root_path` with the default
    /// transport and engines.
    pub async fn open(config: Config) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).build().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Token that stops in-flight stages when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a source without driving it. The document stays `PENDING`.
    pub async fn submit(
        &self,
        source: &str,
        document_id: Option<&str>,
    ) -> Result<String, PipelineError> {
        self.ensure_running()?;
        self.fetcher.register(source, document_id).await
    }

    /// Register `source` if new and drive it to a terminal state.
    ///
    /// An already indexed document is re-fetched, so a changed source
    /// produces a new version. A failed document is reported as is; use
    /// [`Pipeline::redrive`] to retry it.
    pub async fn ingest(
        &self,
        source: &str,
        document_id: Option<&str>,
    ) -> Result<DocumentReport, PipelineError> {
        self.ensure_running()?;
        let document_id = self.fetcher.register(source, document_id).await?;
        let state = self.ledger.state(&document_id).await?;
        if state == Some(PipelineState::Indexed) {
            self.refetch(&document_id).await
        } else {
            self.drive(&document_id).await
        }
    }

    /// Run stages until the document is `INDEXED` or `FAILED`.
    pub async fn drive(&self, document_id: &str) -> Result<DocumentReport, PipelineError> {
        self.ensure_running()?;
        let lease = self
            .leases
            .acquire(document_id)
            .ok_or_else(|| PipelineError::Busy(document_id.to_string()))?;

        self.drive_leased(&lease).await
    }

    /// Requeue a `FAILED` document at the stage it failed in and drive it.
    pub async fn redrive(&self, document_id: &str) -> Result<DocumentReport, PipelineError> {
        self.ensure_running()?;
        let lease = self
            .leases
            .acquire(document_id)
            .ok_or_else(|| PipelineError::Busy(document_id.to_string()))?;

        let custody = self.known_custody(document_id).await?;
        let failure = custody
            .failure
            .ok_or_else(|| LedgerError::InvalidTransition {
                document_id: document_id.to_string(),
                detail: "document has not failed".to_string(),
            })?;

        self.ledger
            .append(
                NewEvent::new(document_id, failure.stage, EventStatus::Requeued).with_metadata(
                    json!({ "failed_seq": failure.seq, "previous_error": failure.detail }),
                ),
            )
            .await?;
        tracing::info!(document_id, stage = %failure.stage, "requeued");

        self.drive_leased(&lease).await
    }

    /// Fetch the recorded source again and drive whatever changed.
    ///
    /// Unchanged bytes leave the document where it was. A fetch failure on
    /// an `INDEXED` document is returned without touching its state; the
    /// indexed version stays valid.
    pub async fn refetch(&self, document_id: &str) -> Result<DocumentReport, PipelineError> {
        self.ensure_running()?;
        let lease = self
            .leases
            .acquire(document_id)
            .ok_or_else(|| PipelineError::Busy(document_id.to_string()))?;

        let custody = self.known_custody(document_id).await?;
        if let Some(failure) = &custody.failure {
            return Err(LedgerError::InvalidTransition {
                document_id: document_id.to_string(),
                detail: format!("document failed at {}; redrive it first", failure.stage),
            }
            .into());
        }

        let fetched = self
            .retry
            .run("refetch", PipelineError::is_retryable, |attempt| async move {
                self.report_stage(document_id, Stage::Fetch, attempt);
                self.guarded(Stage::Fetch, self.fetcher.fetch_document(document_id))
                    .await
            })
            .await;

        match fetched {
            Ok(outcome) => {
                if outcome.unchanged {
                    tracing::info!(document_id, "source unchanged");
                }
                self.drive_leased(&lease).await
            }
            Err(e) if e.is_fatal() => Err(self.halt(e)),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) if custody.state() == PipelineState::Indexed => {
                tracing::warn!(document_id, error = %e, "refetch failed; indexed version kept");
                Err(e)
            }
            Err(e) => {
                self.record_failure(document_id, Stage::Fetch, &e).await?;
                self.report(document_id).await
            }
        }
    }

    /// Drive every document that is not `INDEXED` or `FAILED`.
    pub async fn resume(self: &Arc<Self>) -> Result<Vec<DocumentReport>, PipelineError> {
        self.ensure_running()?;
        let mut pending = Vec::new();
        for document_id in self.ledger.document_ids().await? {
            match self.ledger.state(&document_id).await? {
                Some(state) if !state.is_terminal() => pending.push(document_id),
                _ => {}
            }
        }
        tracing::info!(documents = pending.len(), "resuming");
        Ok(self.run_all(pending).await)
    }

    /// Drive many documents on the worker pool. Reports come back in input
    /// order, one per distinct document.
    pub async fn run_all(self: &Arc<Self>, document_ids: Vec<String>) -> Vec<DocumentReport> {
        self.spawn_jobs(document_ids.into_iter().map(Job::Drive).collect())
            .await
    }

    /// Ingest many sources on the worker pool. Reports come back in input
    /// order, one per distinct document.
    pub async fn ingest_all(self: &Arc<Self>, sources: Vec<String>) -> Vec<DocumentReport> {
        self.spawn_jobs(sources.into_iter().map(Job::Ingest).collect())
            .await
    }

    async fn spawn_jobs(self: &Arc<Self>, jobs: Vec<Job>) -> Vec<DocumentReport> {
        // One job per document; a repeated source would only find its own
        // lease taken.
        let mut seen = HashSet::new();
        let jobs: Vec<(String, Job)> = jobs
            .into_iter()
            .map(|job| match job {
                Job::Ingest(source) => (document_id_for(&source), Job::Ingest(source)),
                Job::Drive(id) => (id.clone(), Job::Drive(id)),
            })
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();

        let total = jobs.len() as u64;
        let permits = Arc::new(Semaphore::new(self.config.pipeline.workers.max(1)));
        let mut set = JoinSet::new();

        // Slots keep input order; a worker that panics leaves its slot FAILED.
        let mut reports: Vec<DocumentReport> = jobs
            .iter()
            .map(|(id, _)| DocumentReport {
                document_id: id.clone(),
                state: PipelineState::Failed,
                error_detail: Some("worker task panicked".to_string()),
            })
            .collect();

        for (i, (document_id, job)) in jobs.into_iter().enumerate() {
            let pipeline = Arc::clone(self);
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = match job {
                    Job::Ingest(source) => pipeline.ingest(&source, None).await,
                    Job::Drive(id) => pipeline.drive(&id).await,
                };
                (i, pipeline.settle(&document_id, result).await)
            });
        }

        let mut done = 0u64;
        while let Some(joined) = set.join_next().await {
            done += 1;
            self.progress
                .report(ProgressEvent::Batch { n: done, total });
            match joined {
                Ok((i, report)) => reports[i] = report,
                Err(e) => tracing::error!(error = %e, "worker task panicked"),
            }
        }
        reports
    }

    /// Turn a driver result into a report, reading the ledger for the
    /// state when the driver itself could not run.
    pub async fn settle(
        &self,
        document_id: &str,
        result: Result<DocumentReport, PipelineError>,
    ) -> DocumentReport {
        match result {
            Ok(report) => report,
            Err(e) => {
                let state = self
                    .ledger
                    .state(document_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(PipelineState::Pending);
                DocumentReport {
                    document_id: document_id.to_string(),
                    state,
                    error_detail: Some(e.to_string()),
                }
            }
        }
    }

    /// Clear the index and rebuild it from the ledger.
    ///
    /// Every `INDEXED` document is re-committed from the text its ledger
    /// lineage points at. Documents mid-way through a new version are left
    /// out until they index again.
    pub async fn rebuild_index(&self) -> Result<RebuildReport, PipelineError> {
        self.ensure_running()?;
        let events = self.ledger.replay().await?;

        let mut order: Vec<String> = Vec::new();
        let mut custody: HashMap<String, Custody> = HashMap::new();
        for event in &events {
            let c = custody.entry(event.document_id.clone()).or_insert_with(|| {
                order.push(event.document_id.clone());
                Custody::empty(&event.document_id)
            });
            c.apply(event).map_err(|detail| LedgerError::ChainBroken {
                document_id: event.document_id.clone(),
                seq: event.seq,
                detail,
            })?;
        }

        self.indexer.clear().await?;
        let mut report = RebuildReport {
            documents: 0,
            events_replayed: events.len() as u64,
        };
        for document_id in &order {
            let Some(c) = custody.get(document_id) else {
                continue;
            };
            if c.state() != PipelineState::Indexed {
                continue;
            }
            if let Some(hash) = &c.indexed_hash {
                self.indexer.index(document_id, hash).await?;
                report.documents += 1;
            }
        }
        tracing::info!(
            documents = report.documents,
            events = report.events_replayed,
            "index rebuilt"
        );
        Ok(report)
    }

    /// Cancel in-flight stages and close the databases.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.indexer.close().await;
        self.ledger.close().await;
    }

    // ============ Driver ============

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.is_halted() {
            Err(PipelineError::Halted)
        } else if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn halt(&self, error: PipelineError) -> PipelineError {
        tracing::error!(error = %error, "fatal integrity error; halting pipeline");
        self.halted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        error
    }

    async fn known_custody(&self, document_id: &str) -> Result<Custody, PipelineError> {
        let custody = self.ledger.custody(document_id).await?;
        if custody.is_known() {
            Ok(custody)
        } else {
            Err(PipelineError::UnknownDocument(document_id.to_string()))
        }
    }

    async fn report(&self, document_id: &str) -> Result<DocumentReport, PipelineError> {
        let custody = self.known_custody(document_id).await?;
        let state = custody.state();
        self.progress.report(ProgressEvent::Finished {
            document_id: document_id.to_string(),
            state,
        });
        Ok(DocumentReport {
            document_id: document_id.to_string(),
            state,
            error_detail: custody.failure.map(|f| f.detail),
        })
    }

    async fn drive_leased(&self, lease: &LeaseGuard) -> Result<DocumentReport, PipelineError> {
        let document_id = lease.document_id();
        loop {
            self.ensure_running()?;
            if !lease.renew() {
                return Err(PipelineError::Busy(document_id.to_string()));
            }
            let custody = self.known_custody(document_id).await?;
            let Some(stage) = custody.state().next_stage() else {
                return self.report(document_id).await;
            };

            let result = self
                .retry
                .run(stage.as_str(), PipelineError::is_retryable, |attempt| {
                    self.attempt_stage(document_id, stage, attempt)
                })
                .await;

            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(self.halt(e)),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) if e.is_engine_unavailable() => {
                    tracing::error!(
                        document_id,
                        stage = %stage,
                        error = %e,
                        "engine unavailable; document left in place"
                    );
                    return Err(e);
                }
                Err(e) => self.record_failure(document_id, stage, &e).await?,
            }
        }
    }

    async fn record_failure(
        &self,
        document_id: &str,
        stage: Stage,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        let detail = format!("{}: {}", stage, error);
        tracing::warn!(document_id, stage = %stage, error = %error, "stage failed");
        self.ledger
            .append(NewEvent::new(document_id, stage, EventStatus::Failed).with_error(detail))
            .await
            .map_err(|e| self.halt(e.into()))?;
        Ok(())
    }

    fn report_stage(&self, document_id: &str, stage: Stage, attempt: u32) {
        self.progress.report(ProgressEvent::Stage {
            document_id: document_id.to_string(),
            stage,
            attempt,
        });
    }

    fn timeout_for(&self, stage: Stage) -> Duration {
        let t = &self.config.timeouts;
        Duration::from_secs(match stage {
            Stage::Fetch => t.fetch_secs,
            Stage::Convert => t.convert_secs,
            Stage::Ocr => t.ocr_secs,
            Stage::Assemble | Stage::Index => t.index_secs,
        })
    }

    /// Run `fut` under the stage timeout, racing cancellation.
    async fn guarded<T, F>(&self, stage: Stage, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let limit = self.timeout_for(stage);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            r = tokio::time::timeout(limit, fut) => match r {
                Ok(r) => r,
                Err(_) => Err(PipelineError::Timeout(limit.as_secs())),
            },
        }
    }

    async fn attempt_stage(
        &self,
        document_id: &str,
        stage: Stage,
        attempt: u32,
    ) -> Result<(), PipelineError> {
        // A previous attempt may have committed before failing.
        if attempt > 1 {
            let custody = self.known_custody(document_id).await?;
            if custody.state().next_stage() != Some(stage) {
                return Ok(());
            }
        }
        self.report_stage(document_id, stage, attempt);

        match stage {
            Stage::Fetch => self
                .guarded(stage, async {
                    self.fetcher.fetch_document(document_id).await.map(|_| ())
                })
                .await,
            Stage::Convert => self
                .guarded(stage, async {
                    self.converter.convert(document_id).await.map(|_| ())
                })
                .await,
            // OCR is timed per page.
            Stage::Ocr => self.run_ocr(document_id).await,
            Stage::Assemble => self.guarded(stage, self.run_assemble(document_id)).await,
            Stage::Index => self.guarded(stage, self.run_index(document_id)).await,
        }
    }

    // ============ Stages ============

    /// Recognize every page not already recorded, ledgering each as a
    /// partial OCR event, then close the stage with `OCR_DONE`.
    ///
    /// All pages are attempted even after one fails, so the pages that did
    /// succeed are kept. Under the strict page policy any failed page fails
    /// the stage; under the lenient policy failed pages are listed in the
    /// `OCR_DONE` metadata and become gap markers at assembly.
    async fn run_ocr(&self, document_id: &str) -> Result<(), PipelineError> {
        let custody = self.known_custody(document_id).await?;
        let total = custody.pages.len() as u32;
        let mut failures: Vec<(u32, PipelineError)> = Vec::new();

        for page in &custody.pages {
            if custody.ocr_pages.contains_key(&page.sequence) {
                continue;
            }
            match self.guarded(Stage::Ocr, self.ocr.recognize(page)).await {
                Err(e) if e.is_engine_unavailable() => return Err(e),
                Ok(out) => {
                    self.ledger
                        .append(
                            NewEvent::new(document_id, Stage::Ocr, EventStatus::Partial)
                                .with_artifacts(vec![out.artifact.clone()])
                                .with_metadata(json!({
                                    "engine": self.ocr.engine_name(),
                                    "confidence": out.confidence,
                                    "low_confidence": out.low_confidence,
                                })),
                        )
                        .await?;
                    self.progress.report(ProgressEvent::Page {
                        document_id: document_id.to_string(),
                        page: out.page,
                        total,
                        confidence: out.confidence,
                    });
                }
                Err(e @ (PipelineError::Ocr { .. } | PipelineError::Timeout(_))) => {
                    tracing::warn!(document_id, page = page.sequence, error = %e, "page not recognized");
                    failures.push((page.sequence, e));
                }
                Err(e) => return Err(e),
            }
        }

        if self.config.pipeline.strict_page_policy {
            if let Some((_, e)) = failures.into_iter().next() {
                return Err(e);
            }
            self.ledger
                .append(NewEvent::new(document_id, Stage::Ocr, EventStatus::Succeeded))
                .await?;
        } else {
            let missing: Vec<_> = failures
                .iter()
                .map(|(page, e)| json!({ "page": page, "reason": e.to_string() }))
                .collect();
            self.ledger
                .append(
                    NewEvent::new(document_id, Stage::Ocr, EventStatus::Succeeded)
                        .with_metadata(json!({ "missing": missing })),
                )
                .await?;
        }

        tracing::info!(document_id, pages = total, "ocr done");
        Ok(())
    }

    async fn run_assemble(&self, document_id: &str) -> Result<(), PipelineError> {
        let custody = self.known_custody(document_id).await?;
        let source_hash = custody
            .fetched_hash
            .clone()
            .ok_or_else(|| PipelineError::UnknownDocument(document_id.to_string()))?;

        let mut inputs = Vec::with_capacity(custody.pages.len());
        for page in &custody.pages {
            let n = page.sequence;
            match custody.ocr_pages.get(&n) {
                Some(artifact) => inputs.push(PageInput::Recognized {
                    page: n,
                    text: self.ocr.load_text(artifact)?,
                    confidence: artifact.confidence.unwrap_or(0.0),
                }),
                None => inputs.push(PageInput::Missing {
                    page: n,
                    reason: custody
                        .missing_pages
                        .get(&n)
                        .cloned()
                        .unwrap_or_else(|| "not recognized".to_string()),
                }),
            }
        }

        let policy = PagePolicy::from_strict(self.config.pipeline.strict_page_policy);
        let text = assemble(document_id, &source_hash, custody.version, &inputs, policy)?;
        let bytes = text
            .to_bytes()
            .map_err(|e| PipelineError::Assembly(format!("serialize text: {}", e)))?;
        let hash = self.store.put(&bytes)?;

        let threshold = self.config.pipeline.low_confidence_threshold;
        let gaps: Vec<u32> = text.pages.iter().filter(|p| p.missing).map(|p| p.page).collect();
        self.ledger
            .append(
                NewEvent::new(document_id, Stage::Assemble, EventStatus::Succeeded)
                    .with_hash(hash.clone())
                    .with_metadata(json!({
                        "pages": text.pages.len(),
                        "chars": text.text.len(),
                        "missing_pages": gaps,
                        "low_confidence_pages": text.low_confidence_pages(threshold),
                        "min_confidence": text.min_confidence(),
                    })),
            )
            .await?;

        tracing::info!(document_id, hash = %hash.short(), pages = text.pages.len(), "assembled");
        Ok(())
    }

    async fn run_index(&self, document_id: &str) -> Result<(), PipelineError> {
        let custody = self.known_custody(document_id).await?;
        let Some((_, text_hash)) = custody.assembled.clone() else {
            return Err(PipelineError::UnknownDocument(document_id.to_string()));
        };

        if self.config.pipeline.block_low_confidence {
            let (text, _) = self.indexer.load_assembled(document_id, &text_hash).await?;
            let threshold = self.config.pipeline.low_confidence_threshold;
            let low = text.low_confidence_pages(threshold);
            if !low.is_empty() {
                let pages: Vec<String> = low.iter().map(|p| p.to_string()).collect();
                return Err(PipelineError::LowConfidence(format!(
                    "pages {} below confidence threshold {}",
                    pages.join(", "),
                    threshold
                )));
            }
        }

        let entry = self.indexer.index(document_id, &text_hash).await?;
        self.ledger
            .append(
                NewEvent::new(document_id, Stage::Index, EventStatus::Succeeded)
                    .with_hash(text_hash)
                    .with_metadata(json!({
                        "assembled_seq": entry.ledger_seq,
                        "pages": entry.page_offsets.len(),
                        "low_confidence_pages": entry.low_confidence_pages,
                        "min_confidence": entry.min_confidence,
                    })),
            )
            .await?;
        Ok(())
    }
}
