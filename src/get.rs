//! Document custody reports.
//!
//! Backs `vault history <id>` (the chain of custody, event by event),
//! `vault show <id>` (derived state, artifacts, and the index entry), and
//! `vault list` (one line per known document).

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::content_store::ContentStore;
use crate::indexer::Indexer;
use crate::ledger::Ledger;
use crate::models::{IndexEntry, LedgerEvent, PipelineState};
use crate::retry::RetryPolicy;

/// Everything the vault knows about one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub document_id: String,
    pub source: Option<String>,
    pub state: PipelineState,
    pub version: u32,
    pub error_detail: Option<String>,
    pub fetched_hash: Option<String>,
    pub pages: usize,
    pub pages_recognized: usize,
    pub missing_pages: Vec<u32>,
    pub assembled_hash: Option<String>,
    pub events: usize,
    pub index_entry: Option<IndexEntry>,
}

/// Core lookup returning structured data (used by `show` and tests).
pub async fn get_document(config: &Config, document_id: &str) -> Result<DocumentView> {
    let ledger = Arc::new(Ledger::open(&config.ledger_path()).await?);
    let custody = ledger.custody(document_id).await?;
    if !custody.is_known() {
        ledger.close().await;
        bail!("document not found: {}", document_id);
    }

    let store = Arc::new(ContentStore::open(config.objects_dir())?);
    let indexer = Indexer::open(
        &config.index_path(),
        ledger.clone(),
        store,
        config.pipeline.low_confidence_threshold,
        RetryPolicy::from_config(&config.pipeline),
    )
    .await?;
    let index_entry = indexer.entry(document_id).await?;
    indexer.close().await;
    ledger.close().await;

    Ok(DocumentView {
        document_id: document_id.to_string(),
        source: custody.source.clone(),
        state: custody.state(),
        version: custody.version,
        error_detail: custody.failure.as_ref().map(|f| f.detail.clone()),
        fetched_hash: custody.fetched_hash.as_ref().map(|h| h.to_string()),
        pages: custody.pages.len(),
        pages_recognized: custody.ocr_pages.len(),
        missing_pages: custody.missing_pages.keys().copied().collect(),
        assembled_hash: custody.assembled.as_ref().map(|(_, h)| h.to_string()),
        events: custody.events,
        index_entry,
    })
}

/// CLI entry point for `show`.
pub async fn run_show(config: &Config, document_id: &str, json: bool) -> Result<()> {
    let doc = get_document(config, document_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Document ---");
    println!("id:           {}", doc.document_id);
    println!("source:       {}", doc.source.as_deref().unwrap_or("(unknown)"));
    println!("state:        {}", doc.state);
    println!("version:      {}", doc.version);
    if let Some(ref detail) = doc.error_detail {
        println!("error:        {}", detail);
    }
    if let Some(ref hash) = doc.fetched_hash {
        println!("raw:          {}", hash);
    }
    println!(
        "pages:        {} ({} recognized)",
        doc.pages, doc.pages_recognized
    );
    if !doc.missing_pages.is_empty() {
        println!("missing:      {}", join_pages(&doc.missing_pages));
    }
    if let Some(ref hash) = doc.assembled_hash {
        println!("text:         {}", hash);
    }
    println!("events:       {}", doc.events);
    println!();

    match doc.index_entry {
        Some(entry) => {
            println!("--- Index entry ---");
            println!("version:      {}", entry.version);
            println!("text:         {}", entry.content_hash);
            println!("ledger seq:   {}", entry.ledger_seq);
            println!("indexed_at:   {}", entry.indexed_at.format("%Y-%m-%dT%H:%M:%SZ"));
            if let Some(min) = entry.min_confidence {
                println!("confidence:   min {:.2}", min);
            }
            if !entry.low_confidence_pages.is_empty() {
                println!(
                    "low pages:    {}",
                    join_pages(&entry.low_confidence_pages)
                );
            }
            println!();
            for span in &entry.page_offsets {
                let text = entry.text.get(span.start..span.end).unwrap_or("");
                println!(
                    "[page {}] {}",
                    span.page,
                    match span.confidence {
                        Some(c) => format!("{:.2}", c),
                        None => "gap".to_string(),
                    }
                );
                println!("{}", text);
                println!();
            }
        }
        None => println!("(not indexed)"),
    }

    Ok(())
}

/// One row of `vault list`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub state: PipelineState,
    pub version: u32,
    pub source: Option<String>,
}

/// Every document in the ledger, in registration order.
pub async fn list_documents(config: &Config) -> Result<Vec<DocumentSummary>> {
    let ledger = Ledger::open(&config.ledger_path()).await?;
    let mut documents = Vec::new();
    for document_id in ledger.document_ids().await? {
        let custody = ledger.custody(&document_id).await?;
        documents.push(DocumentSummary {
            state: custody.state(),
            version: custody.version,
            source: custody.source.clone(),
            document_id,
        });
    }
    ledger.close().await;
    Ok(documents)
}

/// CLI entry point for `list`.
pub async fn run_list(config: &Config) -> Result<()> {
    let documents = list_documents(config).await?;
    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in &documents {
        println!("{}", format_summary(doc));
    }
    Ok(())
}

fn format_summary(doc: &DocumentSummary) -> String {
    format!(
        "{}  {:<9}  v{:<3} {}",
        doc.document_id,
        doc.state.as_str(),
        doc.version,
        doc.source.as_deref().unwrap_or("(unknown)")
    )
}

/// Chain of custody for one document, oldest first.
pub async fn get_history(config: &Config, document_id: &str) -> Result<Vec<LedgerEvent>> {
    let ledger = Ledger::open(&config.ledger_path()).await?;
    let history = ledger.history(document_id).await?;
    ledger.close().await;
    if history.is_empty() {
        bail!("document not found: {}", document_id);
    }
    Ok(history)
}

/// CLI entry point for `history`.
pub async fn run_history(config: &Config, document_id: &str) -> Result<()> {
    for event in get_history(config, document_id).await? {
        println!("{}", format_event(&event));
    }
    Ok(())
}

/// One line per event: seq, time, stage/status, version, then whichever
/// of hash, artifacts, and error the event carries.
pub fn format_event(event: &LedgerEvent) -> String {
    let mut line = format!(
        "#{:<5} {}  {:<8} {:<10} v{}",
        event.seq,
        event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        event.stage.as_str(),
        event.status.as_str(),
        event.version
    );
    if let Some(ref hash) = event.content_hash {
        line.push_str(&format!("  {}", hash.short()));
    }
    if !event.artifacts.is_empty() {
        let parts: Vec<String> = event
            .artifacts
            .iter()
            .map(|a| match a.confidence {
                Some(c) => format!("p{}={}({:.2})", a.sequence, a.content_hash.short(), c),
                None => format!("p{}={}", a.sequence, a.content_hash.short()),
            })
            .collect();
        line.push_str(&format!("  [{}]", parts.join(" ")));
    }
    if let Some(ref detail) = event.error_detail {
        line.push_str(&format!("  error: {}", detail));
    }
    line
}

fn join_pages(pages: &[u32]) -> String {
    pages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
