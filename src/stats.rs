//! Operator statistics: index size, behavior volume, top queries, and
//! segment distribution.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let catalog_items: i64 = count(&pool, "catalog_items").await?;
    let indexed: i64 = count(&pool, "search_index").await?;
    let events: i64 = count(&pool, "behavior_events").await?;
    let searches: i64 = count(&pool, "search_log").await?;
    let sequences: i64 = count(&pool, "search_sequences").await?;

    println!("catalog items:     {}", catalog_items);
    println!("indexed items:     {}", indexed);
    println!("behavior events:   {}", events);
    println!("logged searches:   {}", searches);
    println!("query transitions: {}", sequences);

    let top_queries: Vec<(String, i64)> = sqlx::query_as(
        "SELECT query, COUNT(*) as count FROM search_log \
         GROUP BY query ORDER BY count DESC, query ASC LIMIT 10",
    )
    .fetch_all(&pool)
    .await?;

    if !top_queries.is_empty() {
        println!();
        println!("top queries:");
        for (query, count) in &top_queries {
            println!("  {:>5}  {}", count, query);
        }
    }

    let segment_counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT primary_segment, COUNT(*) as count FROM actor_segments \
         GROUP BY primary_segment ORDER BY count DESC, primary_segment ASC",
    )
    .fetch_all(&pool)
    .await?;

    if !segment_counts.is_empty() {
        let total: i64 = segment_counts.iter().map(|(_, c)| c).sum();
        println!();
        println!("primary segments:");
        for (segment, count) in &segment_counts {
            let pct = if total > 0 {
                100.0 * *count as f64 / total as f64
            } else {
                0.0
            };
            println!("  {:>5}  {:<20} {:>5.1}%", count, segment, pct);
        }
    }

    pool.close().await;
    Ok(())
}

async fn count(pool: &SqlitePool, table: &str) -> Result<i64> {
    let n = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(n)
}
