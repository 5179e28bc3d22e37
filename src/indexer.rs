//! Full-text index commits.
//!
//! The index lives in its own SQLite database (`index.sqlite`) so it can
//! be dropped and rebuilt from the ledger at any time. Each document has
//! one row in `index_entries` and one FTS5 row per recognized page in
//! `index_fts`, so search hits map back to pages.
//!
//! Before committing, the indexer checks lineage: the text must be the
//! content hash of the document's current `ASSEMBLED` event. Anything else
//! is rejected with [`IndexError::NoLineage`]. Commits replace the previous
//! entry in one transaction and are serialized per document. A commit that
//! finds the index locked or unreachable is retried with backoff.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::assemble::AssembledText;
use crate::content_store::ContentStore;
use crate::db;
use crate::error::{IndexError, PipelineError};
use crate::ledger::Ledger;
use crate::migrate;
use crate::models::{ContentHash, IndexEntry, PageSpan, SearchHit};
use crate::retry::RetryPolicy;
use crate::search;

pub struct Indexer {
    pool: SqlitePool,
    ledger: Arc<Ledger>,
    store: Arc<ContentStore>,
    low_confidence_threshold: f32,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Indexer {
    pub async fn open(
        path: &Path,
        ledger: Arc<Ledger>,
        store: Arc<ContentStore>,
        low_confidence_threshold: f32,
        retry: RetryPolicy,
    ) -> Result<Self, IndexError> {
        let pool = db::connect(path).await?;
        migrate::migrate_index(&pool).await?;
        Ok(Self {
            pool,
            ledger,
            store,
            low_confidence_threshold,
            retry,
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

    /// Load an assembled text artifact after checking its lineage.
    ///
    /// Returns the text and the sequence of the `ASSEMBLED` event that
    /// produced it.
    pub async fn load_assembled(
        &self,
        document_id: &str,
        text_hash: &ContentHash,
    ) -> Result<(AssembledText, i64), PipelineError> {
        let custody = self.ledger.custody(document_id).await?;
        let seq = match &custody.assembled {
            Some((seq, hash)) if hash == text_hash => *seq,
            _ => {
                return Err(IndexError::NoLineage {
                    document_id: document_id.to_string(),
                    content_hash: text_hash.to_string(),
                }
                .into())
            }
        };

        let bytes = self.store.get(text_hash)?;
        let assembled = AssembledText::from_bytes(&bytes).map_err(|e| {
            PipelineError::Assembly(format!("text artifact {} unreadable: {}", text_hash, e))
        })?;
        if assembled.document_id != document_id {
            return Err(IndexError::NoLineage {
                document_id: document_id.to_string(),
                content_hash: text_hash.to_string(),
            }
            .into());
        }
        Ok((assembled, seq))
    }

    /// Commit a document's assembled text, replacing any prior entry.
    pub async fn index(
        &self,
        document_id: &str,
        text_hash: &ContentHash,
    ) -> Result<IndexEntry, PipelineError> {
        let (assembled, ledger_seq) = self.load_assembled(document_id, text_hash).await?;

        let entry = IndexEntry {
            document_id: document_id.to_string(),
            version: assembled.version,
            content_hash: text_hash.clone(),
            ledger_seq,
            min_confidence: assembled.min_confidence(),
            low_confidence_pages: assembled.low_confidence_pages(self.low_confidence_threshold),
            page_offsets: assembled.pages.clone(),
            text: assembled.text.clone(),
            indexed_at: Utc::now(),
        };

        self.retry
            .run("index", IndexError::is_retryable, |_| self.commit(&entry))
            .await?;
        tracing::info!(
            document_id,
            version = entry.version,
            pages = entry.page_offsets.len(),
            "indexed"
        );
        Ok(entry)
    }

    async fn commit(&self, entry: &IndexEntry) -> Result<(), IndexError> {
        let lock = self.lock_for(&entry.document_id);
        let _guard = lock.lock().await;

        let page_offsets_json = serde_json::to_string(&entry.page_offsets)
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;
        let low_pages_json = serde_json::to_string(&entry.low_confidence_pages)
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM index_fts WHERE document_id = ?")
            .bind(&entry.document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(&entry.document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO index_entries
                (document_id, version, content_hash, ledger_seq, text, page_offsets_json,
                 min_confidence, low_confidence_pages_json, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.document_id)
        .bind(entry.version as i64)
        .bind(entry.content_hash.as_str())
        .bind(entry.ledger_seq)
        .bind(&entry.text)
        .bind(&page_offsets_json)
        .bind(entry.min_confidence.map(|c| c as f64))
        .bind(&low_pages_json)
        .bind(entry.indexed_at.timestamp())
        .execute(&mut *tx)
        .await?;

        for span in entry.page_offsets.iter().filter(|s| !s.missing) {
            let text = entry.text.get(span.start..span.end).unwrap_or("");
            let low = span
                .confidence
                .is_some_and(|c| c < self.low_confidence_threshold);
            sqlx::query(
                "INSERT INTO index_fts (document_id, page, low_confidence, text) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.document_id)
            .bind(span.page as i64)
            .bind(low as i64)
            .bind(text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>, IndexError> {
        search::search_index(&self.pool, query, limit).await
    }

    pub async fn entry(&self, document_id: &str) -> Result<Option<IndexEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT document_id, version, content_hash, ledger_seq, text, page_offsets_json, \
             min_confidence, low_confidence_pages_json, indexed_at \
             FROM index_entries WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let bad = |what: &str| IndexError::Unavailable(format!("corrupt index row: {}", what));
        let content_hash: String = row.get("content_hash");
        let page_offsets_json: String = row.get("page_offsets_json");
        let low_pages_json: String = row.get("low_confidence_pages_json");
        let version: i64 = row.get("version");
        let min_confidence: Option<f64> = row.get("min_confidence");
        let indexed_at: i64 = row.get("indexed_at");

        Ok(Some(IndexEntry {
            document_id: row.get("document_id"),
            version: u32::try_from(version).map_err(|_| bad("version"))?,
            content_hash: content_hash.parse().map_err(|_| bad("content_hash"))?,
            ledger_seq: row.get("ledger_seq"),
            text: row.get("text"),
            page_offsets: serde_json::from_str::<Vec<PageSpan>>(&page_offsets_json)
                .map_err(|_| bad("page_offsets"))?,
            min_confidence: min_confidence.map(|c| c as f32),
            low_confidence_pages: serde_json::from_str(&low_pages_json)
                .map_err(|_| bad("low_confidence_pages"))?,
            indexed_at: DateTime::from_timestamp(indexed_at, 0).unwrap_or_default(),
        }))
    }

    pub async fn remove(&self, document_id: &str) -> Result<bool, IndexError> {
        let lock = self.lock_for(document_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM index_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM index_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Drop every entry. Used before a rebuild.
    pub async fn clear(&self) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM index_fts").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM index_entries")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, IndexError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM index_entries")
            .fetch_one(&self.pool)
            .await?)
    }
}
