use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::IndexError;
use crate::migrate;
use crate::models::SearchHit;

pub async fn run_search(config: &Config, query: &str, limit: i64) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(&config.index_path()).await?;
    migrate::migrate_index(&pool).await?;
    let hits = search_index(&pool, query, limit).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / page {}{}",
            i + 1,
            hit.score,
            hit.document_id,
            hit.page,
            if hit.low_confidence {
                " (low confidence)"
            } else {
                ""
            }
        );
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!();
    }

    Ok(())
}

/// Page-level keyword search over the FTS index, best first.
pub async fn search_index(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<SearchHit>, IndexError> {
    let Some(expr) = match_expression(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT document_id, page, low_confidence,
               bm25(index_fts) AS score,
               snippet(index_fts, 3, '>>>', '<<<', '...', 16) AS snippet
        FROM index_fts
        WHERE index_fts MATCH ?
        ORDER BY score, document_id, page
        LIMIT ?
        "#,
    )
    .bind(&expr)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let hits = rows
        .iter()
        .map(|row| {
            let score: f64 = row.get("score");
            let page: i64 = row.get("page");
            let low: i64 = row.get("low_confidence");
            SearchHit {
                document_id: row.get("document_id"),
                page: page as u32,
                score: -score, // negate so higher = better
                snippet: row.get("snippet"),
                low_confidence: low != 0,
            }
        })
        .collect();

    Ok(hits)
}

/// Turn free text into an FTS5 expression of quoted terms.
///
/// Every term is quoted so operators and punctuation in user input are
/// matched literally instead of parsed as query syntax.
fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
