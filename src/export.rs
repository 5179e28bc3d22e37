//! Export the provenance ledger as JSON Lines.
//!
//! One event per line in global append order, with the chain hashes
//! included, so the export can be verified or diffed outside the vault.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::ledger::Ledger;
use crate::models::LedgerEvent;

/// Render events as JSON Lines.
pub fn to_jsonl(events: &[LedgerEvent]) -> Result<String> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}

/// Export the ledger, or one document's history.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(
    config: &Config,
    output: Option<&Path>,
    document_id: Option<&str>,
) -> Result<()> {
    let ledger = Ledger::open(&config.ledger_path()).await?;
    let events = match document_id {
        Some(id) => ledger.history(id).await?,
        None => ledger.replay().await?,
    };
    ledger.close().await;

    let jsonl = to_jsonl(&events)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &jsonl)
                .with_context(|| format!("Failed to write export: {}", path.display()))?;
            eprintln!("Exported {} events to {}", events.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(jsonl.as_bytes())?;
            stdout.flush()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventStatus, NewEvent, Stage};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn one_line_per_event_in_append_order() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger.sqlite")).await.unwrap();
        for doc in ["doc-a", "doc-b"] {
            ledger
                .append(
                    NewEvent::new(doc, Stage::Fetch, EventStatus::Registered)
                        .with_metadata(json!({ "source": format!("https://example.org/{}", doc) })),
                )
                .await
                .unwrap();
        }

        let jsonl = to_jsonl(&ledger.replay().await.unwrap()).unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LedgerEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.document_id, "doc-a");
        assert_eq!(first.status, EventStatus::Registered);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["document_id"], "doc-b");
        assert_eq!(second["stage"], "fetch");
    }
}
