use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the vault directories and both database schemas. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    std::fs::create_dir_all(config.objects_dir()).with_context(|| {
        format!(
            "Failed to create object store: {}",
            config.objects_dir().display()
        )
    })?;

    let ledger = db::connect(&config.ledger_path()).await?;
    migrate_ledger(&ledger).await?;
    ledger.close().await;

    let index = db::connect(&config.index_path()).await?;
    migrate_index(&index).await?;
    index.close().await;

    Ok(())
}

pub async fn migrate_ledger(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_events (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            version INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            content_hash TEXT,
            artifacts_json TEXT NOT NULL DEFAULT '[]',
            error_detail TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            prev_hash TEXT NOT NULL,
            event_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ledger_events_document ON ledger_events(document_id, seq)",
    )
    .execute(pool)
    .await?;

    // The ledger is append-only at the storage layer too.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS ledger_events_no_update
        BEFORE UPDATE ON ledger_events
        BEGIN
            SELECT RAISE(ABORT, 'ledger_events is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS ledger_events_no_delete
        BEFORE DELETE ON ledger_events
        BEGIN
            SELECT RAISE(ABORT, 'ledger_events is append-only');
        END
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn migrate_index(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            document_id TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            ledger_seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            page_offsets_json TEXT NOT NULL DEFAULT '[]',
            min_confidence REAL,
            low_confidence_pages_json TEXT NOT NULL DEFAULT '[]',
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE index_fts USING fts5(
                document_id UNINDEXED,
                page UNINDEXED,
                low_confidence UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_root(tmp.path().join("vault"));

        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        assert!(config.objects_dir().is_dir());
        assert!(config.ledger_path().is_file());
        assert!(config.index_path().is_file());
    }

    #[tokio::test]
    async fn ledger_rejects_update_and_delete() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("ledger.sqlite")).await.unwrap();
        migrate_ledger(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO ledger_events (document_id, stage, status, version, timestamp_ms, prev_hash, event_hash) \
             VALUES ('doc-1', 'fetch', 'registered', 0, 0, '', 'h')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let update = sqlx::query("UPDATE ledger_events SET status = 'failed'")
            .execute(&pool)
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM ledger_events").execute(&pool).await;
        assert!(delete.is_err());
    }
}
