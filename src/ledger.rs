//! Append-only provenance ledger.
//!
//! The ledger is the single source of truth for every document's chain of
//! custody. Pipeline state is never stored; it is derived by folding a
//! document's history through [`Custody`].
//!
//! # Guarantees
//!
//! - **Append-only.** Rows live in the `ledger_events` SQLite table, whose
//!   triggers abort any `UPDATE` or `DELETE`.
//! - **Durable.** Each append is one transaction on a WAL database opened
//!   with `synchronous=FULL`; `append` returns only after commit.
//! - **Lineage.** An event is accepted only if it follows from the
//!   document's derived state (a stage succeeds only from its predecessor
//!   state, an index event must name the assembled text). Invalid events are
//!   rejected with [`LedgerError::InvalidTransition`] and nothing is written.
//! - **Tamper-evident.** Events for a document form a SHA-256 hash chain;
//!   [`Ledger::verify`] recomputes it.
//! - **Serialized per document.** Appends for one document take that
//!   document's async mutex; different documents do not wait on each other
//!   beyond SQLite's own write lock.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db;
use crate::error::LedgerError;
use crate::migrate;
use crate::models::{
    ArtifactRef, ContentHash, EventStatus, LedgerEvent, NewEvent, PipelineState, Stage,
};

/// `prev_hash` of a document's first event.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub struct Ledger {
    pool: SqlitePool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Outcome of verifying every hash chain in the ledger.
#[derive(Debug, Default)]
pub struct ChainReport {
    pub documents: u64,
    pub events: u64,
    pub broken: Vec<LedgerError>,
}

impl Ledger {
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let pool = db::connect(path)
            .await
            .map_err(|e| LedgerError::Read(format!("open {}: {}", path.display(), e)))?;
        migrate::migrate_ledger(&pool)
            .await
            .map_err(|e| LedgerError::Read(format!("migrate: {}", e)))?;
        Ok(Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn lock_for(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Validate and durably append one event.
    ///
    /// The ledger assigns `seq`, `version`, `timestamp`, and chain hashes.
    /// Timestamps never go backwards within a document even if the wall
    /// clock does.
    pub async fn append(&self, event: NewEvent) -> Result<LedgerEvent, LedgerError> {
        let lock = self.lock_for(&event.document_id);
        let _guard = lock.lock().await;

        // The document lock is held, so its history cannot move under us.
        let history = self.history(&event.document_id).await?;

        let custody = Custody::replay(&event.document_id, &history).map_err(|detail| {
            LedgerError::ChainBroken {
                document_id: event.document_id.clone(),
                seq: history.last().map(|e| e.seq).unwrap_or(0),
                detail,
            }
        })?;

        let version = custody
            .admit(
                event.stage,
                event.status,
                event.content_hash.as_ref(),
                &event.artifacts,
            )
            .map_err(|detail| LedgerError::InvalidTransition {
                document_id: event.document_id.clone(),
                detail,
            })?;

        let timestamp_ms = Utc::now().timestamp_millis().max(custody.last_timestamp_ms);
        let artifacts_json = serde_json::to_string(&event.artifacts)
            .map_err(|e| LedgerError::AppendFailed(e.to_string()))?;
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|e| LedgerError::AppendFailed(e.to_string()))?;

        let mut stored = StoredEvent {
            seq: 0,
            document_id: event.document_id.clone(),
            stage: event.stage.as_str().to_string(),
            status: event.status.as_str().to_string(),
            version: version as i64,
            timestamp_ms,
            content_hash: event.content_hash.as_ref().map(|h| h.to_string()),
            artifacts_json,
            error_detail: event.error_detail.clone(),
            metadata_json,
            prev_hash: custody.last_hash.clone(),
            event_hash: String::new(),
        };
        stored.event_hash = stored.compute_hash();

        let mut tx = self.pool.begin().await.map_err(append_failed)?;
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_events
                (document_id, stage, status, version, timestamp_ms, content_hash,
                 artifacts_json, error_detail, metadata_json, prev_hash, event_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.document_id)
        .bind(&stored.stage)
        .bind(&stored.status)
        .bind(stored.version)
        .bind(stored.timestamp_ms)
        .bind(&stored.content_hash)
        .bind(&stored.artifacts_json)
        .bind(&stored.error_detail)
        .bind(&stored.metadata_json)
        .bind(&stored.prev_hash)
        .bind(&stored.event_hash)
        .execute(&mut *tx)
        .await
        .map_err(append_failed)?;

        stored.seq = result.last_insert_rowid();
        tx.commit().await.map_err(append_failed)?;

        tracing::debug!(
            document_id = %stored.document_id,
            stage = %stored.stage,
            status = %stored.status,
            seq = stored.seq,
            "ledger append"
        );

        stored.into_event()
    }

    /// Every event for a document, in append order.
    pub async fn history(&self, document_id: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = sqlx::query(SELECT_DOCUMENT)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_failed)?;
        rows.iter()
            .map(|row| StoredEvent::from_row(row).into_event())
            .collect()
    }

    /// Known documents in first-seen order.
    pub async fn document_ids(&self) -> Result<Vec<String>, LedgerError> {
        let rows = sqlx::query(
            "SELECT document_id, MIN(seq) AS first_seq FROM ledger_events \
             GROUP BY document_id ORDER BY first_seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed)?;
        Ok(rows.iter().map(|row| row.get("document_id")).collect())
    }

    /// Derived custody state. Unknown documents yield an empty custody.
    pub async fn custody(&self, document_id: &str) -> Result<Custody, LedgerError> {
        let history = self.history(document_id).await?;
        Custody::replay(document_id, &history).map_err(|detail| LedgerError::ChainBroken {
            document_id: document_id.to_string(),
            seq: history.last().map(|e| e.seq).unwrap_or(0),
            detail,
        })
    }

    /// Derived pipeline state, or `None` for an unknown document.
    pub async fn state(&self, document_id: &str) -> Result<Option<PipelineState>, LedgerError> {
        let custody = self.custody(document_id).await?;
        Ok(custody.is_known().then(|| custody.state()))
    }

    /// Recompute one document's hash chain. Returns the number of events
    /// checked.
    pub async fn verify(&self, document_id: &str) -> Result<u64, LedgerError> {
        let rows = sqlx::query(SELECT_DOCUMENT)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_failed)?;

        let broken = |seq: i64, detail: String| LedgerError::ChainBroken {
            document_id: document_id.to_string(),
            seq,
            detail,
        };

        let mut expected_prev = GENESIS_HASH.to_string();
        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored = StoredEvent::from_row(row);
            if stored.prev_hash != expected_prev {
                return Err(broken(stored.seq, "prev_hash does not link".to_string()));
            }
            if stored.compute_hash() != stored.event_hash {
                return Err(broken(stored.seq, "event hash mismatch".to_string()));
            }
            expected_prev = stored.event_hash.clone();
            let seq = stored.seq;
            events.push(stored.into_event().map_err(|e| broken(seq, e.to_string()))?);
        }

        Custody::replay(document_id, &events)
            .map_err(|detail| broken(events.last().map(|e| e.seq).unwrap_or(0), detail))?;

        Ok(events.len() as u64)
    }

    pub async fn verify_all(&self) -> Result<ChainReport, LedgerError> {
        let mut report = ChainReport::default();
        for document_id in self.document_ids().await? {
            report.documents += 1;
            match self.verify(&document_id).await {
                Ok(n) => report.events += n,
                Err(e @ LedgerError::ChainBroken { .. }) => {
                    tracing::error!(document_id = %document_id, error = %e, "hash chain broken");
                    report.broken.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Every event in global append order.
    pub async fn replay(&self) -> Result<Vec<LedgerEvent>, LedgerError> {
        let rows = sqlx::query(SELECT_ALL)
            .fetch_all(&self.pool)
            .await
            .map_err(read_failed)?;
        rows.iter()
            .map(|row| StoredEvent::from_row(row).into_event())
            .collect()
    }
}

const SELECT_ALL: &str = "SELECT seq, document_id, stage, status, version, timestamp_ms, \
     content_hash, artifacts_json, error_detail, metadata_json, prev_hash, event_hash \
     FROM ledger_events ORDER BY seq";

const SELECT_DOCUMENT: &str = "SELECT seq, document_id, stage, status, version, timestamp_ms, \
     content_hash, artifacts_json, error_detail, metadata_json, prev_hash, event_hash \
     FROM ledger_events WHERE document_id = ? ORDER BY seq";

fn append_failed(e: sqlx::Error) -> LedgerError {
    LedgerError::AppendFailed(e.to_string())
}

fn read_failed(e: sqlx::Error) -> LedgerError {
    LedgerError::Read(e.to_string())
}

/// A row exactly as stored. Hashing works on these strings so that
/// verification does not depend on JSON re-serialization.
struct StoredEvent {
    seq: i64,
    document_id: String,
    stage: String,
    status: String,
    version: i64,
    timestamp_ms: i64,
    content_hash: Option<String>,
    artifacts_json: String,
    error_detail: Option<String>,
    metadata_json: String,
    prev_hash: String,
    event_hash: String,
}

impl StoredEvent {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            seq: row.get("seq"),
            document_id: row.get("document_id"),
            stage: row.get("stage"),
            status: row.get("status"),
            version: row.get("version"),
            timestamp_ms: row.get("timestamp_ms"),
            content_hash: row.get("content_hash"),
            artifacts_json: row.get("artifacts_json"),
            error_detail: row.get("error_detail"),
            metadata_json: row.get("metadata_json"),
            prev_hash: row.get("prev_hash"),
            event_hash: row.get("event_hash"),
        }
    }

    fn compute_hash(&self) -> String {
        let version = self.version.to_string();
        let timestamp = self.timestamp_ms.to_string();
        let fields: [&str; 10] = [
            &self.prev_hash,
            &self.document_id,
            &self.stage,
            &self.status,
            &version,
            &timestamp,
            self.content_hash.as_deref().unwrap_or(""),
            &self.artifacts_json,
            self.error_detail.as_deref().unwrap_or(""),
            &self.metadata_json,
        ];
        let mut hasher = Sha256::new();
        for field in fields {
            // Length prefix keeps field boundaries unambiguous.
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn into_event(self) -> Result<LedgerEvent, LedgerError> {
        let bad = |what: &str| LedgerError::Read(format!("seq {}: invalid {}", self.seq, what));

        let stage = Stage::parse(&self.stage).ok_or_else(|| bad("stage"))?;
        let status = EventStatus::parse(&self.status).ok_or_else(|| bad("status"))?;
        let timestamp: DateTime<Utc> =
            DateTime::from_timestamp_millis(self.timestamp_ms).ok_or_else(|| bad("timestamp"))?;
        let content_hash = match &self.content_hash {
            Some(h) => Some(h.parse::<ContentHash>().map_err(|_| bad("content_hash"))?),
            None => None,
        };
        let artifacts: Vec<ArtifactRef> =
            serde_json::from_str(&self.artifacts_json).map_err(|_| bad("artifacts"))?;
        let metadata: serde_json::Value =
            serde_json::from_str(&self.metadata_json).map_err(|_| bad("metadata"))?;
        let version = u32::try_from(self.version).map_err(|_| bad("version"))?;

        Ok(LedgerEvent {
            seq: self.seq,
            document_id: self.document_id,
            stage,
            status,
            version,
            timestamp,
            content_hash,
            artifacts,
            error_detail: self.error_detail,
            metadata,
            prev_hash: self.prev_hash,
            event_hash: self.event_hash,
        })
    }
}

/// A recorded stage failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub stage: Stage,
    pub detail: String,
    pub seq: i64,
}

/// Chain-of-custody state derived from a document's history.
///
/// The same fold validates appends and derives state, so the ledger can
/// never accept an event that replay would reject.
#[derive(Debug, Clone)]
pub struct Custody {
    pub document_id: String,
    pub source: Option<String>,
    /// Current document version; 0 until the first successful fetch.
    pub version: u32,
    pub failure: Option<Failure>,
    pub fetched_hash: Option<ContentHash>,
    /// Page image artifacts of the current version, in page order.
    pub pages: Vec<ArtifactRef>,
    /// Pages recognized so far, keyed by page number.
    pub ocr_pages: BTreeMap<u32, ArtifactRef>,
    /// Pages the OCR stage gave up on, with the reason.
    pub missing_pages: BTreeMap<u32, String>,
    /// `(seq, text hash)` of the current `ASSEMBLED` event.
    pub assembled: Option<(i64, ContentHash)>,
    pub indexed_hash: Option<ContentHash>,
    pub events: usize,
    pub last_seq: i64,
    progress: PipelineState,
    last_hash: String,
    last_timestamp_ms: i64,
}

impl Custody {
    pub fn empty(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            source: None,
            version: 0,
            failure: None,
            fetched_hash: None,
            pages: Vec::new(),
            ocr_pages: BTreeMap::new(),
            missing_pages: BTreeMap::new(),
            assembled: None,
            indexed_hash: None,
            events: 0,
            last_seq: 0,
            progress: PipelineState::Pending,
            last_hash: GENESIS_HASH.to_string(),
            last_timestamp_ms: 0,
        }
    }

    pub fn replay(document_id: &str, history: &[LedgerEvent]) -> Result<Self, String> {
        let mut custody = Custody::empty(document_id);
        for event in history {
            custody
                .apply(event)
                .map_err(|detail| format!("seq {}: {}", event.seq, detail))?;
        }
        Ok(custody)
    }

    pub fn is_known(&self) -> bool {
        self.events > 0
    }

    pub fn state(&self) -> PipelineState {
        if self.failure.is_some() {
            PipelineState::Failed
        } else {
            self.progress
        }
    }

    /// Check whether an event may be appended; returns the version it will
    /// carry.
    pub fn admit(
        &self,
        stage: Stage,
        status: EventStatus,
        content_hash: Option<&ContentHash>,
        artifacts: &[ArtifactRef],
    ) -> Result<u32, String> {
        if self.events == 0 {
            return if status == EventStatus::Registered && stage == Stage::Fetch {
                Ok(0)
            } else {
                Err("document must be registered first".to_string())
            };
        }

        match status {
            EventStatus::Registered => Err("document is already registered".to_string()),
            EventStatus::Failed => {
                if let Some(f) = &self.failure {
                    Err(format!("document already failed at {}", f.stage))
                } else if self.progress == PipelineState::Indexed {
                    Err("indexed documents cannot fail".to_string())
                } else {
                    Ok(self.version)
                }
            }
            EventStatus::Requeued => match &self.failure {
                Some(f) if f.stage == stage => Ok(self.version),
                Some(f) => Err(format!("document failed at {}, not {}", f.stage, stage)),
                None => Err("document has not failed".to_string()),
            },
            EventStatus::Partial => {
                self.require_live()?;
                if stage != Stage::Ocr {
                    return Err(format!("{} has no partial progress", stage));
                }
                self.require_progress(stage)?;
                let page = match artifacts {
                    [a] if a.stage == Stage::Ocr => a.sequence,
                    _ => return Err("partial OCR event must carry one OCR artifact".to_string()),
                };
                if page == 0 || page as usize > self.pages.len() {
                    return Err(format!("page {} out of range", page));
                }
                if self.ocr_pages.contains_key(&page) {
                    return Err(format!("page {} already recognized", page));
                }
                Ok(self.version)
            }
            EventStatus::Succeeded => {
                self.require_live()?;
                match stage {
                    Stage::Fetch => {
                        let hash = content_hash
                            .ok_or_else(|| "fetch success needs a content hash".to_string())?;
                        if self.fetched_hash.as_ref() == Some(hash) {
                            Ok(self.version)
                        } else {
                            Ok(self.version + 1)
                        }
                    }
                    Stage::Convert => {
                        self.require_progress(stage)?;
                        if artifacts.is_empty() {
                            return Err("conversion produced no pages".to_string());
                        }
                        for (i, a) in artifacts.iter().enumerate() {
                            if a.stage != Stage::Convert || a.sequence as usize != i + 1 {
                                return Err("page artifacts must be numbered from 1".to_string());
                            }
                        }
                        Ok(self.version)
                    }
                    Stage::Ocr => {
                        self.require_progress(stage)?;
                        Ok(self.version)
                    }
                    Stage::Assemble => {
                        self.require_progress(stage)?;
                        content_hash
                            .ok_or_else(|| "assembly success needs a text hash".to_string())?;
                        Ok(self.version)
                    }
                    Stage::Index => {
                        self.require_progress(stage)?;
                        let hash = content_hash
                            .ok_or_else(|| "index success needs a text hash".to_string())?;
                        match &self.assembled {
                            Some((_, assembled)) if assembled == hash => Ok(self.version),
                            _ => Err(format!("text {} was not assembled for this document", hash)),
                        }
                    }
                }
            }
        }
    }

    fn require_live(&self) -> Result<(), String> {
        match &self.failure {
            Some(f) => Err(format!("document failed at {}; requeue it first", f.stage)),
            None => Ok(()),
        }
    }

    fn require_progress(&self, stage: Stage) -> Result<(), String> {
        if self.progress == stage.predecessor() {
            Ok(())
        } else {
            Err(format!(
                "{} cannot succeed from {}",
                stage.completes(),
                self.progress
            ))
        }
    }

    /// Fold one committed event into the state.
    pub fn apply(&mut self, event: &LedgerEvent) -> Result<(), String> {
        let version = self.admit(
            event.stage,
            event.status,
            event.content_hash.as_ref(),
            &event.artifacts,
        )?;
        if version != event.version {
            return Err(format!(
                "version {} recorded, {} expected",
                event.version, version
            ));
        }
        let ts = event.timestamp.timestamp_millis();
        if ts < self.last_timestamp_ms {
            return Err("timestamp moves backwards".to_string());
        }

        match (event.status, event.stage) {
            (EventStatus::Registered, _) => {
                self.source = event
                    .metadata
                    .get("source")
                    .and_then(|s| s.as_str())
                    .map(String::from);
            }
            (EventStatus::Failed, stage) => {
                self.failure = Some(Failure {
                    stage,
                    detail: event.error_detail.clone().unwrap_or_default(),
                    seq: event.seq,
                });
            }
            (EventStatus::Requeued, stage) => {
                self.failure = None;
                self.progress = stage.predecessor();
            }
            (EventStatus::Partial, _) => {
                if let Some(a) = event.artifacts.first() {
                    self.ocr_pages.insert(a.sequence, a.clone());
                }
            }
            (EventStatus::Succeeded, Stage::Fetch) => {
                let changed = self.fetched_hash != event.content_hash;
                if changed || self.progress == PipelineState::Pending {
                    self.progress = PipelineState::Fetched;
                    self.fetched_hash = event.content_hash.clone();
                    self.version = version;
                    self.pages.clear();
                    self.ocr_pages.clear();
                    self.missing_pages.clear();
                    self.assembled = None;
                }
            }
            (EventStatus::Succeeded, Stage::Convert) => {
                self.pages = event.artifacts.clone();
                self.ocr_pages.clear();
                self.missing_pages.clear();
                self.progress = PipelineState::Converted;
            }
            (EventStatus::Succeeded, Stage::Ocr) => {
                self.missing_pages = missing_pages(&event.metadata);
                self.progress = PipelineState::OcrDone;
            }
            (EventStatus::Succeeded, Stage::Assemble) => {
                if let Some(hash) = &event.content_hash {
                    self.assembled = Some((event.seq, hash.clone()));
                }
                self.progress = PipelineState::Assembled;
            }
            (EventStatus::Succeeded, Stage::Index) => {
                self.indexed_hash = event.content_hash.clone();
                self.progress = PipelineState::Indexed;
            }
        }

        self.events += 1;
        self.last_seq = event.seq;
        self.last_hash = event.event_hash.clone();
        self.last_timestamp_ms = ts;
        Ok(())
    }
}

/// `OCR_DONE` metadata lists pages left unrecognized under the lenient
/// policy as `{"missing": [{"page": 2, "reason": "..."}]}`.
fn missing_pages(metadata: &serde_json::Value) -> BTreeMap<u32, String> {
    metadata
        .get("missing")
        .and_then(|m| m.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    let page = e.get("page")?.as_u64()?;
                    let reason = e.get("reason").and_then(|r| r.as_str()).unwrap_or("");
                    Some((u32::try_from(page).ok()?, reason.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}
