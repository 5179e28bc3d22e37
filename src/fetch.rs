//! Document retrieval.
//!
//! The [`Fetcher`] pulls a document's bytes through a [`Transport`], stores
//! them in the content store, and records a `FETCHED` event carrying the
//! source, content type, and size.
//!
//! Retry strategy:
//! - timeout, connection error, HTTP 429 or 5xx → retry with backoff
//! - malformed URL, other HTTP 4xx, missing local file, oversize body →
//!   fail immediately with [`FetchError::Permanent`]

use async_trait::async_trait;
use serde_json::json;
use std::io::ErrorKind;
use std::sync::Arc;
use std::path::Path;
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::Config;
use crate::content_store::ContentStore;
use crate::error::{FetchError, PipelineError};
use crate::ledger::Ledger;
use crate::models::{
    document_id_for, is_remote, is_valid_document_id, normalize_source, ContentHash, EventStatus,
    NewEvent, Stage,
};
use crate::retry::RetryPolicy;

/// Raw bytes as delivered by a transport.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Something that can turn a source reference into bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, source: &str) -> Result<Fetched, FetchError>;
}

/// HTTP(S) transport on `reqwest` with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.fetch_secs))
            .user_agent(config.fetch.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Permanent(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: config.fetch.max_bytes,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, source: &str) -> Result<Fetched, FetchError> {
        let url = reqwest::Url::parse(source)
            .map_err(|e| FetchError::Permanent(format!("malformed URL {:?}: {}", source, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::Permanent(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }

        let mut response = self.client.get(url).send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Permanent(e.to_string())
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {}", status)));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(too_large(len, self.max_bytes));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body: {}", e)))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(too_large(bytes.len() as u64, self.max_bytes));
            }
        }

        Ok(Fetched {
            bytes,
            content_type,
        })
    }
}

/// Local paths and `file://` URLs.
pub struct LocalFileTransport {
    max_bytes: u64,
}

impl LocalFileTransport {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

#[async_trait]
impl Transport for LocalFileTransport {
    async fn get(&self, source: &str) -> Result<Fetched, FetchError> {
        let path = source.strip_prefix("file://").unwrap_or(source);
        let io_err = |e: std::io::Error| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                FetchError::Permanent(format!("{}: {}", path, e))
            }
            _ => FetchError::Transient(format!("{}: {}", path, e)),
        };

        let meta = tokio::fs::metadata(path).await.map_err(io_err)?;
        if !meta.is_file() {
            return Err(FetchError::Permanent(format!("{}: not a regular file", path)));
        }
        if meta.len() > self.max_bytes {
            return Err(too_large(meta.len(), self.max_bytes));
        }

        let bytes = tokio::fs::read(path).await.map_err(io_err)?;
        Ok(Fetched {
            bytes,
            content_type: content_type_for_path(path).map(String::from),
        })
    }
}

/// Routes remote references to HTTP and everything else to the local
/// filesystem.
pub struct SourceTransport {
    http: HttpTransport,
    local: LocalFileTransport,
}

impl SourceTransport {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpTransport::new(config)?,
            local: LocalFileTransport::new(config.fetch.max_bytes),
        })
    }
}

#[async_trait]
impl Transport for SourceTransport {
    async fn get(&self, source: &str) -> Result<Fetched, FetchError> {
        if is_remote(source) {
            self.http.get(source).await
        } else {
            self.local.get(source).await
        }
    }
}

/// Every `*.pdf` file under `dir`, recursively, as sorted path strings.
pub fn discover_sources(dir: &Path) -> Result<Vec<String>, FetchError> {
    if !dir.is_dir() {
        return Err(FetchError::Permanent(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut sources = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| FetchError::Permanent(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_pdf = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if is_pdf {
            sources.push(entry.path().to_string_lossy().into_owned());
        }
    }
    sources.sort();
    Ok(sources)
}

fn too_large(size: u64, max: u64) -> FetchError {
    FetchError::Permanent(format!("document is {} bytes, limit is {}", size, max))
}

fn content_type_for_path(path: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(path)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// What a fetch did.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub document_id: String,
    pub content_hash: ContentHash,
    pub version: u32,
    /// Bytes matched the current version; nothing downstream changes.
    pub unchanged: bool,
}

pub struct Fetcher {
    transport: Arc<dyn Transport>,
    store: Arc<ContentStore>,
    ledger: Arc<Ledger>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<ContentStore>,
        ledger: Arc<Ledger>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            ledger,
            retry,
        }
    }

    /// Register `source` under its derived id (or `explicit_id`) if the
    /// ledger has not seen it. Returns the document id.
    pub async fn register(
        &self,
        source: &str,
        explicit_id: Option<&str>,
    ) -> Result<String, PipelineError> {
        let normalized = normalize_source(source);
        if normalized.is_empty() {
            return Err(FetchError::Permanent("empty source reference".to_string()).into());
        }
        let document_id = match explicit_id {
            Some(id) if is_valid_document_id(id) => id.to_string(),
            Some(id) => {
                return Err(FetchError::Permanent(format!("invalid document id: {:?}", id)).into())
            }
            None => document_id_for(&normalized),
        };

        let custody = self.ledger.custody(&document_id).await?;
        if custody.is_known() {
            if let Some(existing) = &custody.source {
                if existing != &normalized {
                    return Err(FetchError::Permanent(format!(
                        "{} is already registered for {}",
                        document_id, existing
                    ))
                    .into());
                }
            }
            return Ok(document_id);
        }

        self.ledger
            .append(
                NewEvent::new(&document_id, Stage::Fetch, EventStatus::Registered)
                    .with_metadata(json!({ "source": normalized })),
            )
            .await?;
        tracing::info!(document_id = %document_id, source = %normalized, "registered");
        Ok(document_id)
    }

    /// Register if needed, then fetch.
    pub async fn fetch(&self, source: &str) -> Result<FetchOutcome, PipelineError> {
        let document_id = self.register(source, None).await?;
        self.fetch_document(&document_id).await
    }

    /// Fetch the source recorded for an already registered document.
    pub async fn fetch_document(&self, document_id: &str) -> Result<FetchOutcome, PipelineError> {
        let custody = self.ledger.custody(document_id).await?;
        let source = custody
            .source
            .clone()
            .ok_or_else(|| PipelineError::UnknownDocument(document_id.to_string()))?;

        let fetched = self
            .retry
            .run("fetch", FetchError::is_retryable, |_| {
                self.transport.get(&source)
            })
            .await?;

        let hash = ContentHash::compute(&fetched.bytes);
        let unchanged = custody.fetched_hash.as_ref() == Some(&hash);
        if !self.store.exists(&hash) {
            self.store.put(&fetched.bytes)?;
        }

        let event = self
            .ledger
            .append(
                NewEvent::new(document_id, Stage::Fetch, EventStatus::Succeeded)
                    .with_hash(hash.clone())
                    .with_metadata(json!({
                        "source": source,
                        "content_type": fetched.content_type,
                        "size_bytes": fetched.bytes.len(),
                        "unchanged": unchanged,
                    })),
            )
            .await?;

        tracing::info!(
            document_id,
            hash = %hash.short(),
            size = fetched.bytes.len(),
            version = event.version,
            unchanged,
            "fetched"
        );

        Ok(FetchOutcome {
            document_id: document_id.to_string(),
            content_hash: hash,
            version: event.version,
            unchanged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Plays back a fixed list of responses, repeating the last one.
    struct Scripted {
        responses: Mutex<Vec<Result<Fetched, FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Fetched, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn get(&self, _source: &str) -> Result<Fetched, FetchError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.remove(0)
            } else {
                match &responses[0] {
                    Ok(f) => Ok(f.clone()),
                    Err(FetchError::Permanent(m)) => Err(FetchError::Permanent(m.clone())),
                    Err(FetchError::Transient(m)) => Err(FetchError::Transient(m.clone())),
                }
            };
            next
        }
    }

    fn body(bytes: &[u8]) -> Result<Fetched, FetchError> {
        Ok(Fetched {
            bytes: bytes.to_vec(),
            content_type: Some("application/pdf".to_string()),
        })
    }

    async fn fetcher(transport: Arc<dyn Transport>) -> (TempDir, Fetcher, Arc<Ledger>, Arc<ContentStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::open(tmp.path().join("objects")).unwrap());
        let ledger = Arc::new(Ledger::open(&tmp.path().join("ledger.sqlite")).await.unwrap());
        let retry = RetryPolicy {
            budget: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };
        let fetcher = Fetcher::new(transport, store.clone(), ledger.clone(), retry);
        (tmp, fetcher, ledger, store)
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let transport = Scripted::new(vec![
            Err(FetchError::Transient("HTTP 503".into())),
            Err(FetchError::Transient("HTTP 503".into())),
            body(b"%PDF-1.4 report"),
        ]);
        let (_tmp, fetcher, ledger, store) = fetcher(transport.clone()).await;

        let outcome = fetcher.fetch("https://example.org/report.pdf").await.unwrap();
        assert_eq!(transport.calls(), 3);
        assert_eq!(outcome.version, 1);
        assert!(store.exists(&outcome.content_hash));

        let history = ledger.history(&outcome.document_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].metadata["size_bytes"], 15);
        assert_eq!(history[1].metadata["content_type"], "application/pdf");
    }

    #[tokio::test]
    async fn not_found_fails_immediately() {
        let transport = Scripted::new(vec![Err(FetchError::Permanent("HTTP 404".into()))]);
        let (_tmp, fetcher, _ledger, _store) = fetcher(transport.clone()).await;

        let err = fetcher.fetch("https://example.org/missing.pdf").await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(FetchError::Permanent(_))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn unchanged_refetch_is_audited_without_new_version() {
        let transport = Scripted::new(vec![body(b"same bytes")]);
        let (_tmp, fetcher, ledger, store) = fetcher(transport).await;

        let first = fetcher.fetch("https://example.org/a.pdf").await.unwrap();
        let objects_before = store.verify().unwrap().objects_checked;
        let second = fetcher.fetch_document(&first.document_id).await.unwrap();

        assert!(second.unchanged);
        assert_eq!(second.version, first.version);
        assert_eq!(store.verify().unwrap().objects_checked, objects_before);

        let history = ledger.history(&first.document_id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].metadata["unchanged"], true);
    }

    #[tokio::test]
    async fn explicit_ids_are_validated() {
        let transport = Scripted::new(vec![body(b"x")]);
        let (_tmp, fetcher, _ledger, _store) = fetcher(transport).await;

        assert_eq!(
            fetcher
                .register("https://example.org/a.pdf", Some("case-17"))
                .await
                .unwrap(),
            "case-17"
        );
        assert!(fetcher
            .register("https://example.org/a.pdf", Some("bad/id"))
            .await
            .is_err());
        assert!(fetcher
            .register("https://example.org/b.pdf", Some("case-17"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn local_transport_classifies_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let transport = LocalFileTransport::new(1024);
        let fetched = transport
            .get(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, b"%PDF-1.4");
        assert_eq!(fetched.content_type.as_deref(), Some("application/pdf"));

        let missing = transport
            .get(&tmp.path().join("nope.pdf").display().to_string())
            .await
            .unwrap_err();
        assert!(!missing.is_retryable());

        let small = LocalFileTransport::new(4);
        assert!(matches!(
            small.get(&path.display().to_string()).await,
            Err(FetchError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn malformed_url_is_permanent() {
        let transport = HttpTransport::new(&Config::with_root("/tmp/unused")).unwrap();
        let err = transport.get("https://").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn discover_sources_finds_pdfs_recursively() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("nested/deeper")).unwrap();
        std::fs::write(tmp.path().join("b.pdf"), b"%PDF").unwrap();
        std::fs::write(tmp.path().join("nested/A.PDF"), b"%PDF").unwrap();
        std::fs::write(tmp.path().join("nested/deeper/c.pdf"), b"%PDF").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"text").unwrap();
        std::fs::create_dir_all(tmp.path().join("folder.pdf")).unwrap();

        let found = discover_sources(tmp.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|s| {
                Path::new(s)
                    .strip_prefix(tmp.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["b.pdf", "nested/A.PDF", "nested/deeper/c.pdf"]);

        assert!(discover_sources(&tmp.path().join("notes.txt")).is_err());
    }
}
