//! Core data models used throughout the vault.
//!
//! These types describe documents, ledger events, stored artifacts, and the
//! index entries that flow through the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A pipeline stage. Every ledger event belongs to exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Convert,
    Ocr,
    Assemble,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Convert,
        Stage::Ocr,
        Stage::Assemble,
        Stage::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Convert => "convert",
            Stage::Ocr => "ocr",
            Stage::Assemble => "assemble",
            Stage::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// State a document must be in before this stage may succeed.
    pub fn predecessor(&self) -> PipelineState {
        match self {
            Stage::Fetch => PipelineState::Pending,
            Stage::Convert => PipelineState::Fetched,
            Stage::Ocr => PipelineState::Converted,
            Stage::Assemble => PipelineState::OcrDone,
            Stage::Index => PipelineState::Assembled,
        }
    }

    /// State reached when this stage succeeds.
    pub fn completes(&self) -> PipelineState {
        match self {
            Stage::Fetch => PipelineState::Fetched,
            Stage::Convert => PipelineState::Converted,
            Stage::Ocr => PipelineState::OcrDone,
            Stage::Assemble => PipelineState::Assembled,
            Stage::Index => PipelineState::Indexed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Document reference accepted; nothing fetched yet.
    Registered,
    Succeeded,
    /// Per-page progress within the OCR stage.
    Partial,
    Failed,
    /// A failed document handed back to its failing stage.
    Requeued,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Registered => "registered",
            EventStatus::Succeeded => "succeeded",
            EventStatus::Partial => "partial",
            EventStatus::Failed => "failed",
            EventStatus::Requeued => "requeued",
        }
    }

    pub fn parse(s: &str) -> Option<EventStatus> {
        match s {
            "registered" => Some(EventStatus::Registered),
            "succeeded" => Some(EventStatus::Succeeded),
            "partial" => Some(EventStatus::Partial),
            "failed" => Some(EventStatus::Failed),
            "requeued" => Some(EventStatus::Requeued),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived position of a document in the pipeline. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Pending,
    Fetched,
    Converted,
    OcrDone,
    Assembled,
    Indexed,
    Failed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 7] = [
        PipelineState::Pending,
        PipelineState::Fetched,
        PipelineState::Converted,
        PipelineState::OcrDone,
        PipelineState::Assembled,
        PipelineState::Indexed,
        PipelineState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "PENDING",
            PipelineState::Fetched => "FETCHED",
            PipelineState::Converted => "CONVERTED",
            PipelineState::OcrDone => "OCR_DONE",
            PipelineState::Assembled => "ASSEMBLED",
            PipelineState::Indexed => "INDEXED",
            PipelineState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Indexed | PipelineState::Failed)
    }

    /// The stage that moves a document out of this state, if any.
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Pending => Some(Stage::Fetch),
            PipelineState::Fetched => Some(Stage::Convert),
            PipelineState::Converted => Some(Stage::Ocr),
            PipelineState::OcrDone => Some(Stage::Assemble),
            PipelineState::Assembled => Some(Stage::Index),
            PipelineState::Indexed | PipelineState::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub fn compute(bytes: &[u8]) -> Self {
        ContentHash(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == 64
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(ContentHash(s.to_string()))
        } else {
            Err(format!("not a sha256 hex digest: {:?}", s))
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> String {
        h.0
    }
}

/// Reference to a derived artifact held by the content store.
///
/// `(document_id, stage, sequence)` identifies the artifact within a
/// document; `content_hash` addresses its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub stage: Stage,
    pub sequence: u32,
    pub content_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// An immutable, committed ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Global append sequence.
    pub seq: i64,
    pub document_id: String,
    pub stage: Stage,
    pub status: EventStatus,
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub content_hash: Option<ContentHash>,
    pub artifacts: Vec<ArtifactRef>,
    pub error_detail: Option<String>,
    pub metadata: serde_json::Value,
    pub prev_hash: String,
    pub event_hash: String,
}

/// An event as proposed by a component, before the ledger assigns
/// sequence, version, timestamp, and chain hashes.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub document_id: String,
    pub stage: Stage,
    pub status: EventStatus,
    pub content_hash: Option<ContentHash>,
    pub artifacts: Vec<ArtifactRef>,
    pub error_detail: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn new(document_id: impl Into<String>, stage: Stage, status: EventStatus) -> Self {
        Self {
            document_id: document_id.into(),
            stage,
            status,
            content_hash: None,
            artifacts: Vec::new(),
            error_detail: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Byte range of one page within assembled text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpan {
    pub page: u32,
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// The span holds a gap marker rather than recognized text.
    #[serde(default)]
    pub missing: bool,
}

/// A committed full-text index entry.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    pub document_id: String,
    pub version: u32,
    pub content_hash: ContentHash,
    /// Sequence of the `ASSEMBLED` event this text came from.
    pub ledger_seq: i64,
    pub text: String,
    pub page_offsets: Vec<PageSpan>,
    pub min_confidence: Option<f32>,
    pub low_confidence_pages: Vec<u32>,
    pub indexed_at: DateTime<Utc>,
}

/// A search result returned from the index.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub page: u32,
    pub score: f64,
    pub snippet: String,
    pub low_confidence: bool,
}

/// Normalize a source reference so the same source always maps to the
/// same document. URLs are kept verbatim after trimming; local paths are
/// made absolute.
pub fn normalize_source(source: &str) -> String {
    let trimmed = source.trim();
    if is_remote(trimmed) || trimmed.starts_with("file://") {
        return trimmed.to_string();
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        return trimmed.to_string();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path).display().to_string(),
        Err(_) => trimmed.to_string(),
    }
}

pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Stable document id for a source reference.
pub fn document_id_for(source: &str) -> String {
    let digest = hex::encode(Sha256::digest(normalize_source(source).as_bytes()));
    format!("doc-{}", &digest[..16])
}

/// Explicit ids are limited to `[A-Za-z0-9._-]{1,128}`.
pub fn is_valid_document_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
