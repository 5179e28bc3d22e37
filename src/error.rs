//! Error taxonomy for every pipeline component.
//!
//! Each component owns one error enum. The orchestrator folds them into
//! [`PipelineError`], and every error answers two questions the pipeline
//! needs to make progress decisions:
//!
//! | Method | Meaning |
//! |--------|---------|
//! | `is_retryable()` | worth another attempt after backoff |
//! | `is_fatal()` | data integrity is at risk; halt all new work |
//!
//! Permanent, non-fatal errors (bad URL, unsupported format) end the
//! document in `FAILED` and leave the rest of the pool running.

use thiserror::Error;

/// Network or local retrieval failures.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Malformed reference, 4xx response, missing local file, oversize body.
    #[error("permanent fetch failure: {0}")]
    Permanent(String),

    /// Timeout, connection reset, 5xx or 429.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Page rendering failures.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt document: {0}")]
    Corrupt(String),

    #[error("resources exhausted during conversion: {0}")]
    ResourceExhausted(String),

    /// The rendering tool is missing from this host.
    #[error("conversion engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl ConversionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConversionError::ResourceExhausted(_))
    }
}

/// Recognition failures. Engine and image failures are retried up to the
/// budget.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine failure: {0}")]
    EngineFailure(String),

    #[error("unreadable page image: {0}")]
    Unreadable(String),

    /// The OCR tool is missing from this host.
    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl OcrError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OcrError::EngineUnavailable(_))
    }
}

/// Full-text index failures.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    /// The text artifact has no `ASSEMBLED` event behind it.
    #[error("no ledger lineage for {document_id} text {content_hash}")]
    NoLineage {
        document_id: String,
        content_hash: String,
    },
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

impl From<sqlx::Error> for IndexError {
    fn from(e: sqlx::Error) -> Self {
        IndexError::Unavailable(e.to_string())
    }
}

/// Content store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Stored bytes do not hash to their address, or a write collided with
    /// different content under the same hash.
    #[error("content store corruption detected for {content_hash}: {detail}")]
    CorruptionDetected {
        content_hash: String,
        detail: String,
    },

    #[error("artifact not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::CorruptionDetected { .. })
    }
}

/// Provenance ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The event could not be durably committed.
    #[error("ledger append failed: {0}")]
    AppendFailed(String),

    #[error("ledger read failed: {0}")]
    Read(String),

    /// The event does not follow from the document's chain of custody.
    #[error("invalid transition for {document_id}: {detail}")]
    InvalidTransition { document_id: String, detail: String },

    #[error("hash chain broken for {document_id} at seq {seq}: {detail}")]
    ChainBroken {
        document_id: String,
        seq: i64,
        detail: String,
    },
}

impl LedgerError {
    /// Append failures are retried by re-running the stage; everything else
    /// is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::AppendFailed(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::AppendFailed(_) | LedgerError::ChainBroken { .. } | LedgerError::Read(_)
        )
    }
}

/// Error surfaced by the orchestrator and by any stage it drives.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("page {page}: {source}")]
    Ocr {
        page: u32,
        #[source]
        source: OcrError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Strict page policy: OCR left gaps so assembly cannot proceed.
    #[error("assembly aborted: {0}")]
    Assembly(String),

    /// Low-confidence pages with `block_low_confidence` enabled.
    #[error("indexing blocked: {0}")]
    LowConfidence(String),

    #[error("stage timed out after {0}s")]
    Timeout(u64),

    #[error("document {0} is leased by another worker")]
    Busy(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("stage cancelled")]
    Cancelled,

    #[error("pipeline halted after a fatal integrity error")]
    Halted,
}

impl PipelineError {
    /// Whether the orchestrator should re-run the whole stage.
    ///
    /// Component-level transient errors are already retried inside the
    /// component, so only timeouts and uncommitted ledger appends qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Timeout(_) => true,
            PipelineError::Ledger(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Storage(e) => e.is_fatal(),
            PipelineError::Ledger(e) => e.is_fatal(),
            PipelineError::Halted => true,
            _ => false,
        }
    }

    /// A missing engine binary says nothing about the document, so it is
    /// reported without ledgering a failure and the document stays where it
    /// was until the host is fixed.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(
            self,
            PipelineError::Conversion(ConversionError::EngineUnavailable(_))
                | PipelineError::Ocr {
                    source: OcrError::EngineUnavailable(_),
                    ..
                }
        )
    }
}
