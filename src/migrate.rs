use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Catalog mirror: raw items as supplied by the feed, so the index
    // can be rebuilt without re-reading it.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_items (
            item_id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            body_text TEXT NOT NULL DEFAULT '',
            sku TEXT,
            category_names TEXT NOT NULL DEFAULT '[]',
            category_ids TEXT NOT NULL DEFAULT '[]',
            tag_names TEXT NOT NULL DEFAULT '[]',
            attributes TEXT NOT NULL DEFAULT '[]',
            price REAL NOT NULL,
            sale_price REAL,
            stock_status TEXT NOT NULL DEFAULT 'in_stock',
            published INTEGER NOT NULL DEFAULT 1,
            total_sales INTEGER NOT NULL DEFAULT 0,
            average_rating REAL NOT NULL DEFAULT 0,
            review_count INTEGER NOT NULL DEFAULT 0,
            featured INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Searchable record per sellable item
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_index (
            item_id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            body_text TEXT NOT NULL DEFAULT '',
            sku TEXT,
            category_names TEXT NOT NULL DEFAULT '',
            category_ids TEXT NOT NULL DEFAULT '',
            tag_names TEXT NOT NULL DEFAULT '',
            attribute_text TEXT NOT NULL DEFAULT '',
            price REAL NOT NULL,
            sale_price REAL,
            stock_status TEXT NOT NULL DEFAULT 'in_stock',
            popularity_score REAL NOT NULL DEFAULT 0,
            search_keywords TEXT NOT NULL DEFAULT '',
            last_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // FTS5 virtual table over the searchable text columns.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='search_index_fts'",
    )
    .fetch_one(&pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE search_index_fts USING fts5(
                item_id UNINDEXED,
                title,
                body_text,
                category_names,
                tag_names,
                attribute_text,
                search_keywords
            )
            "#,
        )
        .execute(&pool)
        .await?;
    }

    // Append-only behavior log, trimmed to a bounded window per actor/kind
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS behavior_events (
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            device TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Every processed query, for popular-suggestion mining
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query TEXT NOT NULL,
            actor_id TEXT,
            result_count INTEGER NOT NULL DEFAULT 0,
            segment TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // previous_query -> next_query transitions, for related-search mining
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_sequences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            previous_query TEXT NOT NULL,
            next_query TEXT NOT NULL,
            gap_seconds INTEGER NOT NULL DEFAULT 0,
            actor_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Per-actor last query; read-then-written in one transaction
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_sessions (
            actor_id TEXT PRIMARY KEY,
            last_query TEXT NOT NULL,
            last_seen_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Oracle spell-correction cache (bounded TTL, checked on read)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spell_cache (
            query TEXT PRIMARY KEY,
            corrected TEXT NOT NULL,
            cached_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Current segment assignment per actor
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actor_segments (
            actor_id TEXT PRIMARY KEY,
            segments_json TEXT NOT NULL DEFAULT '[]',
            primary_segment TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_actor_kind ON behavior_events(actor_id, kind, created_at DESC)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_kind_time ON behavior_events(kind, created_at DESC)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_search_log_query ON search_log(query)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sequences_previous ON search_sequences(previous_query)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_popularity ON search_index(popularity_score DESC)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_updated ON actor_segments(updated_at)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
