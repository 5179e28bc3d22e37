//! End-to-end pipeline tests with scripted transport, renderer, and OCR
//! engines, so no network or external binaries are needed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use custody_vault::config::Config;
use custody_vault::convert::{ConvertEngine, SourceFormat};
use custody_vault::error::{ConversionError, FetchError, LedgerError, OcrError, PipelineError};
use custody_vault::fetch::{Fetched, Transport};
use custody_vault::ledger::Ledger;
use custody_vault::models::{ContentHash, EventStatus, LedgerEvent, PipelineState, Stage};
use custody_vault::ocr::{OcrEngine, Recognized};
use custody_vault::pipeline::{Pipeline, PipelineBuilder};

const REPORT_URL: &str = "https://example.org/report.pdf";

// ============ Fakes ============

/// Serves bodies by source; scripted errors are served first.
#[derive(Default)]
struct FakeTransport {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    errors: Mutex<HashMap<String, Vec<FetchError>>>,
    calls: AtomicU32,
}

impl FakeTransport {
    fn serve(&self, source: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(source.to_string(), body);
    }

    fn fail_next(&self, source: &str, error: FetchError) {
        self.errors
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .push(error);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, source: &str) -> Result<Fetched, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(errors) = self.errors.lock().unwrap().get_mut(source) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        match self.bodies.lock().unwrap().get(source) {
            Some(body) => Ok(Fetched {
                bytes: body.clone(),
                content_type: Some("application/pdf".to_string()),
            }),
            None => Err(FetchError::Permanent("HTTP 404".to_string())),
        }
    }
}

/// A fake PDF: a header line plus `topic=` and `pages=` lines.
fn fake_pdf(topic: &str, pages: u32) -> Vec<u8> {
    format!("%PDF-1.4\ntopic={}\npages={}\n", topic, pages).into_bytes()
}

/// Renders a fake PDF to one `topic|n` image per page.
#[derive(Default)]
struct FakeRenderer {
    /// `ResourceExhausted` failures left before rendering works.
    exhausted: AtomicU32,
    calls: AtomicU32,
}

impl FakeRenderer {
    fn exhausted(times: u32) -> Self {
        Self {
            exhausted: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConvertEngine for FakeRenderer {
    fn name(&self) -> &str {
        "fake-renderer"
    }

    fn supports(&self, format: SourceFormat) -> bool {
        format == SourceFormat::Pdf
    }

    async fn render(
        &self,
        bytes: &[u8],
        _format: SourceFormat,
    ) -> Result<Vec<Vec<u8>>, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.exhausted.load(Ordering::SeqCst);
        if left > 0 {
            self.exhausted.store(left - 1, Ordering::SeqCst);
            return Err(ConversionError::ResourceExhausted("out of memory".into()));
        }
        let body = String::from_utf8_lossy(bytes);
        let field = |key: &str| {
            body.lines()
                .find_map(|l| l.strip_prefix(key))
                .map(str::to_string)
        };
        let topic = field("topic=").ok_or_else(|| ConversionError::Corrupt("no topic".into()))?;
        let pages: u32 = field("pages=")
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ConversionError::Corrupt("no page count".into()))?;
        Ok((1..=pages)
            .map(|n| format!("{}|{}", topic, n).into_bytes())
            .collect())
    }
}

/// A renderer whose binary is not installed.
struct MissingRenderer;

#[async_trait]
impl ConvertEngine for MissingRenderer {
    fn name(&self) -> &str {
        "missing-renderer"
    }

    fn supports(&self, format: SourceFormat) -> bool {
        format == SourceFormat::Pdf
    }

    async fn render(
        &self,
        _bytes: &[u8],
        _format: SourceFormat,
    ) -> Result<Vec<Vec<u8>>, ConversionError> {
        Err(ConversionError::EngineUnavailable(
            "pdftoppm not found; install poppler-utils".into(),
        ))
    }
}

/// Recognizes `topic|n` images as "<topic> report page <n>".
#[derive(Default)]
struct FakeOcr {
    /// Confidence per page, 1-based; 0.9 when unlisted.
    confidences: Vec<f32>,
    /// Failures left per page; `u32::MAX` fails forever.
    failures: Mutex<HashMap<u32, u32>>,
    calls: Mutex<HashMap<u32, u32>>,
    /// Page that never finishes, with a signal when it starts.
    hang_on: Option<u32>,
    started: Notify,
    /// Topic whose pages crash the worker.
    panic_on: Option<String>,
}

impl FakeOcr {
    fn with_confidences(confidences: &[f32]) -> Self {
        Self {
            confidences: confidences.to_vec(),
            ..Default::default()
        }
    }

    fn failing(page: u32, times: u32) -> Self {
        let ocr = Self::default();
        ocr.failures.lock().unwrap().insert(page, times);
        ocr
    }

    fn calls(&self, page: u32) -> u32 {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    fn name(&self) -> &str {
        "fake-ocr"
    }

    async fn recognize(&self, image: &[u8]) -> Result<Recognized, OcrError> {
        let image = String::from_utf8_lossy(image).to_string();
        let (topic, page) = image
            .split_once('|')
            .and_then(|(t, p)| Some((t.to_string(), p.parse::<u32>().ok()?)))
            .ok_or_else(|| OcrError::Unreadable(image.clone()))?;
        *self.calls.lock().unwrap().entry(page).or_default() += 1;

        if self.panic_on.as_deref() == Some(topic.as_str()) {
            panic!("engine crashed on {}", topic);
        }

        if self.hang_on == Some(page) {
            self.started.notify_one();
            std::future::pending::<()>().await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&page) {
                if *left > 0 {
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    return Err(OcrError::EngineFailure("segfault".into()));
                }
            }
        }

        Ok(Recognized {
            text: format!("{} report page {}", topic, page),
            confidence: self
                .confidences
                .get(page as usize - 1)
                .copied()
                .unwrap_or(0.9),
        })
    }
}

// ============ Setup ============

fn test_config(root: &Path) -> Config {
    let mut config = Config::with_root(root);
    config.pipeline.backoff_base_ms = 1;
    config.pipeline.backoff_max_ms = 2;
    config
}

async fn open(config: Config, transport: Arc<FakeTransport>, ocr: Arc<FakeOcr>) -> Arc<Pipeline> {
    open_with(config, transport, Arc::new(FakeRenderer::default()), ocr).await
}

async fn open_with(
    config: Config,
    transport: Arc<FakeTransport>,
    renderer: Arc<dyn ConvertEngine>,
    ocr: Arc<FakeOcr>,
) -> Arc<Pipeline> {
    let pipeline = PipelineBuilder::new(config)
        .transport(transport)
        .convert_engines(vec![renderer])
        .ocr_engine(ocr)
        .build()
        .await
        .unwrap();
    Arc::new(pipeline)
}

fn report_transport() -> Arc<FakeTransport> {
    let transport = Arc::new(FakeTransport::default());
    transport.serve(REPORT_URL, fake_pdf("budget", 3));
    transport
}

fn count(history: &[LedgerEvent], stage: Stage, status: EventStatus) -> usize {
    history
        .iter()
        .filter(|e| e.stage == stage && e.status == status)
        .count()
}

// ============ Scenarios ============

#[tokio::test]
async fn low_confidence_page_is_flagged_not_halted() {
    let tmp = TempDir::new().unwrap();
    let ocr = Arc::new(FakeOcr::with_confidences(&[0.95, 0.40, 0.88]));
    let pipeline = open(test_config(tmp.path()), report_transport(), ocr).await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);
    assert!(report.is_ok());

    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Fetch, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Convert, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Ocr, EventStatus::Partial), 3);
    assert_eq!(count(&history, Stage::Ocr, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Assemble, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Index, EventStatus::Succeeded), 1);

    let page2 = history
        .iter()
        .find(|e| e.status == EventStatus::Partial && e.artifacts[0].sequence == 2)
        .unwrap();
    assert_eq!(page2.metadata["low_confidence"], true);

    let entry = pipeline.indexer().entry("doc1").await.unwrap().unwrap();
    assert_eq!(entry.page_offsets.len(), 3);
    assert_eq!(entry.low_confidence_pages, vec![2]);
    assert_eq!(pipeline.indexer().count().await.unwrap(), 1);

    let hits = pipeline.indexer().search("budget", 10).await.unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.document_id == "doc1"));
    let flagged: Vec<u32> = hits.iter().filter(|h| h.low_confidence).map(|h| h.page).collect();
    assert_eq!(flagged, vec![2]);
}

#[tokio::test]
async fn exhausted_ocr_fails_naming_page_and_keeps_other_pages() {
    let tmp = TempDir::new().unwrap();
    let ocr = Arc::new(FakeOcr::failing(2, u32::MAX));
    let pipeline = open(test_config(tmp.path()), report_transport(), ocr.clone()).await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Failed);
    let detail = report.error_detail.unwrap();
    assert!(detail.starts_with("ocr: page 2:"), "detail: {}", detail);
    assert_eq!(ocr.calls(2), 3);

    let custody = pipeline.ledger().custody("doc1").await.unwrap();
    assert_eq!(custody.ocr_pages.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    for page in &custody.pages {
        assert!(pipeline.store().exists(&page.content_hash));
    }
    for artifact in custody.ocr_pages.values() {
        assert!(pipeline.store().exists(&artifact.content_hash));
    }
    assert_eq!(pipeline.indexer().count().await.unwrap(), 0);
}

#[tokio::test]
async fn redrive_recognizes_only_the_failed_page() {
    let tmp = TempDir::new().unwrap();
    let ocr = Arc::new(FakeOcr::failing(2, 3));
    let pipeline = open(test_config(tmp.path()), report_transport(), ocr.clone()).await;

    let first = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(first.state, PipelineState::Failed);

    let second = pipeline.redrive("doc1").await.unwrap();
    assert_eq!(second.state, PipelineState::Indexed);
    assert_eq!(ocr.calls(1), 1);
    assert_eq!(ocr.calls(2), 4);
    assert_eq!(ocr.calls(3), 1);

    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Ocr, EventStatus::Requeued), 1);
    assert_eq!(count(&history, Stage::Convert, EventStatus::Succeeded), 1);
}

#[tokio::test]
async fn redrive_rejects_healthy_document() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(
        test_config(tmp.path()),
        report_transport(),
        Arc::new(FakeOcr::default()),
    )
    .await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();

    let err = pipeline.redrive("doc1").await.unwrap_err();
    assert!(err.to_string().contains("has not failed"));
}

#[tokio::test]
async fn same_input_yields_identical_artifacts() {
    let mut assembled = Vec::new();
    let mut pages = Vec::new();
    for _ in 0..2 {
        let tmp = TempDir::new().unwrap();
        let ocr = Arc::new(FakeOcr::with_confidences(&[0.95, 0.40, 0.88]));
        let pipeline = open(test_config(tmp.path()), report_transport(), ocr).await;
        pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();

        let custody = pipeline.ledger().custody("doc1").await.unwrap();
        let again = pipeline.ledger().custody("doc1").await.unwrap();
        assert_eq!(custody.state(), again.state());
        assert_eq!(custody.assembled, again.assembled);

        assembled.push(custody.assembled.unwrap().1);
        pages.push(
            custody
                .pages
                .iter()
                .map(|p| p.content_hash.clone())
                .collect::<Vec<ContentHash>>(),
        );
        pipeline.shutdown().await;
    }
    assert_eq!(assembled[0], assembled[1]);
    assert_eq!(pages[0], pages[1]);
}

#[tokio::test]
async fn indexing_twice_leaves_one_entry() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(
        test_config(tmp.path()),
        report_transport(),
        Arc::new(FakeOcr::default()),
    )
    .await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();

    let entry = pipeline.indexer().entry("doc1").await.unwrap().unwrap();
    pipeline
        .indexer()
        .index("doc1", &entry.content_hash)
        .await
        .unwrap();

    assert_eq!(pipeline.indexer().count().await.unwrap(), 1);
    assert_eq!(pipeline.indexer().search("budget", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn restart_resumes_without_repeating_ledgered_work() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();

    let hanging = Arc::new(FakeOcr {
        hang_on: Some(2),
        ..Default::default()
    });
    let first = open(test_config(tmp.path()), transport.clone(), hanging.clone()).await;
    let task = {
        let first = first.clone();
        tokio::spawn(async move { first.ingest(REPORT_URL, Some("doc1")).await })
    };
    hanging.started.notified().await;
    first.cancel_token().cancel();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert_eq!(
        first.ledger().state("doc1").await.unwrap(),
        Some(PipelineState::Converted)
    );
    first.shutdown().await;
    drop(first);

    let ocr = Arc::new(FakeOcr::default());
    let second = open(test_config(tmp.path()), transport.clone(), ocr.clone()).await;
    let reports = second.resume().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, PipelineState::Indexed);

    assert_eq!(ocr.calls(1), 0, "page 1 was already ledgered");
    assert_eq!(ocr.calls(2), 1);
    assert_eq!(ocr.calls(3), 1);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

    let history = second.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Fetch, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Convert, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Ocr, EventStatus::Partial), 3);
}

#[tokio::test]
async fn unchanged_refetch_changes_nothing_and_new_bytes_make_a_version() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();
    let pipeline = open(
        test_config(tmp.path()),
        transport.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    let objects_before = pipeline.store().verify().unwrap().objects_checked;

    let report = pipeline.refetch("doc1").await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);
    assert_eq!(pipeline.store().verify().unwrap().objects_checked, objects_before);
    let custody = pipeline.ledger().custody("doc1").await.unwrap();
    assert_eq!(custody.version, 1);
    assert_eq!(custody.state(), PipelineState::Indexed);

    transport.serve(REPORT_URL, fake_pdf("audit", 2));
    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);

    let entry = pipeline.indexer().entry("doc1").await.unwrap().unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.page_offsets.len(), 2);
    assert!(pipeline.indexer().search("budget", 10).await.unwrap().is_empty());
    assert_eq!(pipeline.indexer().search("audit", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn refetch_failure_keeps_indexed_version() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();
    let pipeline = open(
        test_config(tmp.path()),
        transport.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();

    transport.fail_next(REPORT_URL, FetchError::Permanent("HTTP 410".into()));
    let err = pipeline.refetch("doc1").await.unwrap_err();
    assert!(matches!(err, PipelineError::Fetch(FetchError::Permanent(_))));
    assert_eq!(
        pipeline.ledger().state("doc1").await.unwrap(),
        Some(PipelineState::Indexed)
    );
}

#[tokio::test]
async fn transient_fetch_errors_retry_and_not_found_fails() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();
    transport.fail_next(REPORT_URL, FetchError::Transient("HTTP 503".into()));
    transport.fail_next(REPORT_URL, FetchError::Transient("HTTP 503".into()));
    let pipeline = open(
        test_config(tmp.path()),
        transport.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    let missing = pipeline
        .ingest("https://example.org/missing.pdf", Some("doc2"))
        .await
        .unwrap();
    assert_eq!(missing.state, PipelineState::Failed);
    assert_eq!(
        missing.error_detail.as_deref(),
        Some("fetch: permanent fetch failure: HTTP 404")
    );
    assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn tampered_ledger_row_is_detected() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let pipeline = open(config.clone(), report_transport(), Arc::new(FakeOcr::default())).await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert!(pipeline.ledger().verify_all().await.unwrap().broken.is_empty());
    pipeline.shutdown().await;

    let pool = custody_vault::db::connect(&config.ledger_path()).await.unwrap();
    sqlx::query("DROP TRIGGER ledger_events_no_update")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("UPDATE ledger_events SET metadata_json = '{\"source\":\"forged\"}' WHERE seq = 1")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let ledger = Ledger::open(&config.ledger_path()).await.unwrap();
    let report = ledger.verify_all().await.unwrap();
    assert_eq!(report.broken.len(), 1);
    assert!(report.broken[0].to_string().contains("seq 1"));
}

#[tokio::test]
async fn rebuild_index_restores_search_after_index_loss() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let transport = report_transport();
    let pipeline = open(config.clone(), transport.clone(), Arc::new(FakeOcr::default())).await;
    pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    pipeline.shutdown().await;
    drop(pipeline);

    for suffix in ["", "-wal", "-shm"] {
        let path = format!("{}{}", config.index_path().display(), suffix);
        let _ = std::fs::remove_file(path);
    }

    let pipeline = open(config, transport, Arc::new(FakeOcr::default())).await;
    assert!(pipeline.indexer().search("budget", 10).await.unwrap().is_empty());

    let rebuilt = pipeline.rebuild_index().await.unwrap();
    assert_eq!(rebuilt.documents, 1);
    assert_eq!(pipeline.indexer().search("budget", 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn blocking_low_confidence_fails_at_index_stage() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.pipeline.block_low_confidence = true;
    let ocr = Arc::new(FakeOcr::with_confidences(&[0.95, 0.40, 0.88]));
    let pipeline = open(config, report_transport(), ocr).await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Failed);
    let detail = report.error_detail.unwrap();
    assert!(detail.starts_with("index:"), "detail: {}", detail);
    assert!(detail.contains("pages 2 below"));
    assert_eq!(pipeline.indexer().count().await.unwrap(), 0);
}

#[tokio::test]
async fn lenient_policy_indexes_with_gap_marker() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.pipeline.strict_page_policy = false;
    let pipeline = open(
        config,
        report_transport(),
        Arc::new(FakeOcr::failing(2, u32::MAX)),
    )
    .await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);

    let custody = pipeline.ledger().custody("doc1").await.unwrap();
    assert!(custody.missing_pages.contains_key(&2));

    let entry = pipeline.indexer().entry("doc1").await.unwrap().unwrap();
    assert!(entry.page_offsets[1].missing);
    assert!(entry
        .text
        .contains("[page 2 unavailable: page 2: OCR engine failure: segfault]"));
    let pages: Vec<u32> = pipeline
        .indexer()
        .search("budget", 10)
        .await
        .unwrap()
        .iter()
        .map(|h| h.page)
        .collect();
    assert!(!pages.contains(&2));
    assert_eq!(pages.len(), 2);
}

#[tokio::test]
async fn worker_pool_drives_many_documents() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let topics = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"];
    let sources: Vec<String> = topics
        .iter()
        .map(|t| format!("https://example.org/{}.pdf", t))
        .collect();
    for (source, topic) in sources.iter().zip(topics) {
        transport.serve(source, fake_pdf(topic, 2));
    }
    let mut config = test_config(tmp.path());
    config.pipeline.workers = 3;
    let pipeline = open(config, transport, Arc::new(FakeOcr::default())).await;

    let reports = pipeline.ingest_all(sources.clone()).await;
    assert_eq!(reports.len(), topics.len());
    assert!(reports.iter().all(|r| r.state == PipelineState::Indexed));
    assert_eq!(pipeline.indexer().count().await.unwrap(), topics.len() as i64);

    let hits = pipeline.indexer().search("delta", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].document_id, reports[3].document_id);
}

#[tokio::test]
async fn store_corruption_halts_the_pipeline() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let body = fake_pdf("budget", 3);
    let hash = ContentHash::compute(&body);
    let (prefix, rest) = hash.as_str().split_at(2);
    let object = config.objects_dir().join(prefix).join(rest);
    std::fs::create_dir_all(object.parent().unwrap()).unwrap();
    std::fs::write(&object, b"bit rot").unwrap();

    let pipeline = open(config, report_transport(), Arc::new(FakeOcr::default())).await;
    let err = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap_err();
    assert!(err.is_fatal(), "expected fatal error, got {}", err);
    assert!(pipeline.is_halted());

    let err = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Halted));
    assert_eq!(
        pipeline.ledger().state("doc1").await.unwrap(),
        Some(PipelineState::Fetched)
    );
}

#[tokio::test]
async fn submit_leaves_document_pending_until_resumed() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();
    let pipeline = open(
        test_config(tmp.path()),
        transport.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let id = pipeline.submit(REPORT_URL, None).await.unwrap();
    assert_eq!(
        pipeline.ledger().state(&id).await.unwrap(),
        Some(PipelineState::Pending)
    );
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

    let reports = pipeline.resume().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].document_id, id);
    assert_eq!(reports[0].state, PipelineState::Indexed);
}

#[tokio::test]
async fn locked_index_is_retried_until_the_writer_lets_go() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.pipeline.retry_budget = 6;
    config.pipeline.backoff_base_ms = 100;
    config.pipeline.backoff_max_ms = 400;
    let pipeline = open(config.clone(), report_transport(), Arc::new(FakeOcr::default())).await;

    // Another process holds the index write lock for a while.
    let pool = custody_vault::db::connect(&config.index_path()).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();
    sqlx::query("BEGIN EXCLUSIVE")
        .execute(&mut *conn)
        .await
        .unwrap();
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        sqlx::query("COMMIT").execute(&mut *conn).await.unwrap();
    });

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    holder.await.unwrap();
    pool.close().await;

    assert_eq!(report.state, PipelineState::Indexed, "{:?}", report.error_detail);
    assert_eq!(pipeline.indexer().count().await.unwrap(), 1);
    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Index, EventStatus::Failed), 0);
    assert_eq!(count(&history, Stage::Index, EventStatus::Succeeded), 1);
}

#[tokio::test]
async fn failed_ledger_append_reruns_the_stage_then_halts() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let renderer = Arc::new(FakeRenderer::default());
    let pipeline = open_with(
        config.clone(),
        report_transport(),
        renderer.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let pool = custody_vault::db::connect(&config.ledger_path()).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER ledger_events_refuse_convert BEFORE INSERT ON ledger_events \
         WHEN NEW.stage = 'convert' BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let err = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::Ledger(LedgerError::AppendFailed(_))),
        "got {}",
        err
    );
    assert!(err.is_fatal());
    assert!(pipeline.is_halted());
    assert_eq!(renderer.calls(), config.pipeline.retry_budget);
    assert_eq!(
        pipeline.ledger().state("doc1").await.unwrap(),
        Some(PipelineState::Fetched)
    );
    assert!(matches!(
        pipeline.ingest(REPORT_URL, Some("doc1")).await,
        Err(PipelineError::Halted)
    ));
}

#[tokio::test]
async fn exhausted_renderer_is_retried_then_succeeds() {
    let tmp = TempDir::new().unwrap();
    let renderer = Arc::new(FakeRenderer::exhausted(2));
    let pipeline = open_with(
        test_config(tmp.path()),
        report_transport(),
        renderer.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let report = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap();
    assert_eq!(report.state, PipelineState::Indexed);
    assert_eq!(renderer.calls(), 3);

    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Convert, EventStatus::Succeeded), 1);
    assert_eq!(count(&history, Stage::Convert, EventStatus::Failed), 0);
}

#[tokio::test]
async fn second_driver_of_the_same_document_is_busy() {
    let tmp = TempDir::new().unwrap();
    let ocr = Arc::new(FakeOcr {
        hang_on: Some(2),
        ..Default::default()
    });
    let pipeline = open(test_config(tmp.path()), report_transport(), ocr.clone()).await;

    let first = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.ingest(REPORT_URL, Some("doc1")).await })
    };
    ocr.started.notified().await;

    let err = pipeline.drive("doc1").await.unwrap_err();
    assert!(matches!(&err, PipelineError::Busy(id) if id == "doc1"), "got {}", err);
    assert!(matches!(
        pipeline.redrive("doc1").await,
        Err(PipelineError::Busy(_))
    ));

    pipeline.cancel_token().cancel();
    assert!(matches!(first.await.unwrap(), Err(PipelineError::Cancelled)));
    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert_eq!(count(&history, Stage::Ocr, EventStatus::Partial), 1);
}

#[tokio::test]
async fn repeated_sources_are_driven_once() {
    let tmp = TempDir::new().unwrap();
    let transport = report_transport();
    let pipeline = open(
        test_config(tmp.path()),
        transport.clone(),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let reports = pipeline
        .ingest_all(vec![REPORT_URL.to_string(), REPORT_URL.to_string()])
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, PipelineState::Indexed);
    assert!(reports[0].error_detail.is_none());
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicked_worker_reports_failed_in_its_slot() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let sources: Vec<String> = ["alpha", "bravo"]
        .iter()
        .map(|t| format!("https://example.org/{}.pdf", t))
        .collect();
    transport.serve(&sources[0], fake_pdf("alpha", 1));
    transport.serve(&sources[1], fake_pdf("bravo", 1));
    let ocr = Arc::new(FakeOcr {
        panic_on: Some("alpha".to_string()),
        ..Default::default()
    });
    let pipeline = open(test_config(tmp.path()), transport, ocr).await;

    let reports = pipeline.ingest_all(sources).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].state, PipelineState::Failed);
    assert_eq!(reports[0].error_detail.as_deref(), Some("worker task panicked"));
    assert!(!reports[0].is_ok());
    assert_eq!(reports[1].state, PipelineState::Indexed);
}

#[tokio::test]
async fn missing_engine_leaves_document_in_place() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_with(
        test_config(tmp.path()),
        report_transport(),
        Arc::new(MissingRenderer),
        Arc::new(FakeOcr::default()),
    )
    .await;

    let err = pipeline.ingest(REPORT_URL, Some("doc1")).await.unwrap_err();
    assert!(err.is_engine_unavailable(), "got {}", err);
    assert!(err.to_string().contains("pdftoppm not found"));
    assert!(!pipeline.is_halted());

    let history = pipeline.ledger().history("doc1").await.unwrap();
    assert!(history.iter().all(|e| e.status != EventStatus::Failed));
    assert_eq!(
        pipeline.ledger().state("doc1").await.unwrap(),
        Some(PipelineState::Fetched)
    );
}
