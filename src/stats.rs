//! Vault status overview.
//!
//! Used by `vault status`: how many documents sit in each pipeline state,
//! how large the ledger, index and content store are, and which documents
//! failed and why.

use anyhow::Result;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::content_store::ContentStore;
use crate::db;
use crate::ledger::Ledger;
use crate::models::PipelineState;

/// Per-state document counts, plus the failures.
#[derive(Debug, Default)]
pub struct StateSummary {
    pub counts: Vec<(PipelineState, u64)>,
    pub failures: Vec<(String, String)>,
}

impl StateSummary {
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    pub fn count(&self, state: PipelineState) -> u64 {
        self.counts
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub async fn summarize(ledger: &Ledger) -> Result<StateSummary> {
    let mut summary = StateSummary {
        counts: PipelineState::ALL.iter().map(|s| (*s, 0)).collect(),
        failures: Vec::new(),
    };
    for document_id in ledger.document_ids().await? {
        let custody = ledger.custody(&document_id).await?;
        let state = custody.state();
        if let Some(slot) = summary.counts.iter_mut().find(|(s, _)| *s == state) {
            slot.1 += 1;
        }
        if let Some(failure) = custody.failure {
            summary.failures.push((document_id, failure.detail));
        }
    }
    Ok(summary)
}

/// Entries in the search index, read without creating or migrating it.
async fn index_entry_count(path: &Path) -> Result<i64> {
    if !path.exists() {
        return Ok(0);
    }
    let pool = db::connect(path).await?;
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM index_entries")
        .fetch_one(&pool)
        .await
        .unwrap_or(0);
    pool.close().await;
    Ok(count)
}

/// Run the status command: read the ledger and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let ledger = Ledger::open(&config.ledger_path()).await?;
    let summary = summarize(&ledger).await?;
    let events = ledger.replay().await?.len();

    ledger.close().await;
    let indexed = index_entry_count(&config.index_path()).await?;

    let (objects, object_bytes) = object_totals(config);

    println!("Custody Vault Status");
    println!("====================");
    println!();
    println!("  Root:        {}", config.vault.root_path.display());
    println!(
        "  Ledger:      {} events, {}",
        events,
        format_bytes(file_size(&config.ledger_path()))
    );
    println!(
        "  Index:       {} entries, {}",
        indexed,
        format_bytes(file_size(&config.index_path()))
    );
    println!(
        "  Objects:     {} objects, {}",
        objects,
        format_bytes(object_bytes)
    );
    println!();
    println!("  Documents:   {}", summary.total());
    for (state, n) in &summary.counts {
        println!("    {:<12} {:>6}", state.as_str(), n);
    }

    if !summary.failures.is_empty() {
        println!();
        println!("  Failures:");
        for (document_id, detail) in &summary.failures {
            println!("    {}  {}", document_id, detail);
        }
    }
    println!();

    Ok(())
}

/// Run the verify command: recompute every hash chain and re-hash every
/// stored object. Returns whether everything checked out.
pub async fn run_verify(config: &Config) -> Result<bool> {
    let ledger = Ledger::open(&config.ledger_path()).await?;
    let chains = ledger.verify_all().await?;
    ledger.close().await;

    let store = ContentStore::open(config.objects_dir())?;
    let objects = store.verify()?;

    println!(
        "ledger:  {} documents, {} events verified",
        chains.documents, chains.events
    );
    for broken in &chains.broken {
        println!("  BROKEN  {}", broken);
    }
    println!("objects: {} checked", objects.objects_checked);
    for hash in &objects.corrupt {
        println!("  CORRUPT  {}", hash);
    }

    let ok = chains.broken.is_empty() && objects.corrupt.is_empty();
    if ok {
        eprintln!("Vault verified.");
    } else {
        eprintln!(
            "Verification failed: {} broken chains, {} corrupt objects",
            chains.broken.len(),
            objects.corrupt.len()
        );
    }
    Ok(ok)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn object_totals(config: &Config) -> (u64, u64) {
    WalkDir::new(config.objects_dir())
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .fold((0, 0), |(n, bytes), e| {
            let len = e.metadata().map(|m| m.len()).unwrap_or(0);
            (n + 1, bytes + len)
        })
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, NewEvent, Stage};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn counts_documents_per_state() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger.sqlite")).await.unwrap();
        for doc in ["doc-a", "doc-b"] {
            ledger
                .append(
                    NewEvent::new(doc, Stage::Fetch, EventStatus::Registered)
                        .with_metadata(json!({ "source": "https://example.org/x.pdf" })),
                )
                .await
                .unwrap();
        }
        ledger
            .append(
                NewEvent::new("doc-b", Stage::Fetch, EventStatus::Failed)
                    .with_error("fetch: HTTP 404"),
            )
            .await
            .unwrap();

        let summary = summarize(&ledger).await.unwrap();
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.count(PipelineState::Pending), 1);
        assert_eq!(summary.count(PipelineState::Failed), 1);
        assert_eq!(
            summary.failures,
            vec![("doc-b".to_string(), "fetch: HTTP 404".to_string())]
        );
    }
}
