//! Text index maintenance.
//!
//! Owns the `search_index` record schema and its popularity lifecycle:
//! records are created or replaced when a catalog item is published or
//! updated, removed when it disappears, decayed by the scheduled optimize
//! pass, and re-boosted by recent sales. Retrieval itself lives in
//! [`crate::ranking`]; this module only writes.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::models::{CatalogItem, IndexRecord, ItemAttribute, PurchasePayload, StockStatus};
use crate::oracle::{self, SuggestionOracle};

/// Initial popularity for a freshly indexed item: capped sales and review
/// contributions, linear rating, fixed bonuses for featured/on-sale.
pub fn initial_popularity(item: &CatalogItem) -> f64 {
    let mut score = 0.0;
    score += ((item.total_sales * 10) as f64).min(1000.0);
    if item.average_rating > 0.0 {
        score += item.average_rating * 20.0;
    }
    score += ((item.review_count * 5) as f64).min(500.0);
    if item.featured {
        score += 200.0;
    }
    if item.is_on_sale() {
        score += 100.0;
    }
    score
}

/// Base search keywords: name, sku, category names, tag names.
/// Deduplicated case-insensitively, order preserved.
pub fn base_keywords(item: &CatalogItem) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let candidates = std::iter::once(item.title.clone())
        .chain(item.sku.clone())
        .chain(item.category_names.iter().cloned())
        .chain(item.tag_names.iter().cloned());

    for kw in candidates {
        let kw = kw.trim().to_string();
        if kw.is_empty() {
            continue;
        }
        if seen.insert(kw.to_lowercase()) {
            keywords.push(kw);
        }
    }
    keywords
}

/// Upsert the catalog mirror row and the item's index record.
///
/// Unpublished items keep their catalog row (so a later re-publish can
/// restore them) but are dropped from the index. Oracle keyword
/// augmentation is best-effort: on failure the base keywords stand.
pub async fn upsert_record(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    item: &CatalogItem,
) -> Result<()> {
    store_catalog_item(pool, item).await?;

    if !item.published {
        remove_index_row(pool, item.item_id).await?;
        return Ok(());
    }

    write_index_record(pool, config, oracle, item).await
}

/// Remove an item from the catalog mirror and the index.
pub async fn remove_record(pool: &SqlitePool, item_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM catalog_items WHERE item_id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    remove_index_row(pool, item_id).await
}

/// Re-derive every index record from the catalog mirror. Recovery path.
pub async fn rebuild_all(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
) -> Result<u64> {
    sqlx::query("DELETE FROM search_index").execute(pool).await?;
    sqlx::query("DELETE FROM search_index_fts").execute(pool).await?;

    let items = load_catalog_items(pool).await?;
    let mut rebuilt = 0u64;
    for item in &items {
        if !item.published {
            continue;
        }
        write_index_record(pool, config, oracle, item).await?;
        rebuilt += 1;
    }

    Ok(rebuilt)
}

/// Outcome of one optimize run, for operator output.
#[derive(Debug, Default)]
pub struct OptimizeOutcome {
    pub removed: u64,
    pub decayed: u64,
    pub boosted: u64,
}

/// Scheduled index optimization: drop records for items no longer
/// eligible, decay every popularity score by a fixed factor, then re-boost
/// items purchased in the trailing window.
///
/// Decay is a pure function of the call, not of wall-clock time: two runs
/// apply the squared factor.
pub async fn optimize(pool: &SqlitePool, config: &Config) -> Result<OptimizeOutcome> {
    let mut outcome = OptimizeOutcome::default();

    // Orphaned or unpublished records
    let removed = sqlx::query(
        "DELETE FROM search_index WHERE item_id NOT IN \
         (SELECT item_id FROM catalog_items WHERE published = 1)",
    )
    .execute(pool)
    .await?;
    outcome.removed = removed.rows_affected();

    sqlx::query(
        "DELETE FROM search_index_fts WHERE item_id NOT IN \
         (SELECT item_id FROM search_index)",
    )
    .execute(pool)
    .await?;

    let decayed = sqlx::query("UPDATE search_index SET popularity_score = popularity_score * ?")
        .bind(config.maintenance.decay_factor)
        .execute(pool)
        .await?;
    outcome.decayed = decayed.rows_affected();

    // Sale boost for the trailing window
    let cutoff =
        Utc::now().timestamp() - config.maintenance.sale_window_days * 24 * 3600;
    let payloads: Vec<String> = sqlx::query_scalar(
        "SELECT payload FROM behavior_events WHERE kind = 'purchase' AND created_at > ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut sold: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
    for payload in &payloads {
        let parsed: PurchasePayload = serde_json::from_str(payload).unwrap_or_default();
        for line in &parsed.items {
            *sold.entry(line.item_id).or_insert(0) += 1;
        }
    }

    for (item_id, count) in &sold {
        let updated = sqlx::query(
            "UPDATE search_index SET popularity_score = popularity_score + ? WHERE item_id = ?",
        )
        .bind(config.maintenance.sale_boost * *count as f64)
        .bind(item_id)
        .execute(pool)
        .await?;
        outcome.boosted += updated.rows_affected();
    }

    // Invariant guard: scores never go negative.
    sqlx::query("UPDATE search_index SET popularity_score = 0 WHERE popularity_score < 0")
        .execute(pool)
        .await?;

    tracing::info!(
        target: "csx::index",
        removed = outcome.removed,
        decayed = outcome.decayed,
        boosted = outcome.boosted,
        "index optimize complete"
    );

    Ok(outcome)
}

// ============ Internals ============

async fn store_catalog_item(pool: &SqlitePool, item: &CatalogItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO catalog_items
            (item_id, title, body_text, sku, category_names, category_ids, tag_names,
             attributes, price, sale_price, stock_status, published, total_sales,
             average_rating, review_count, featured, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            title = excluded.title,
            body_text = excluded.body_text,
            sku = excluded.sku,
            category_names = excluded.category_names,
            category_ids = excluded.category_ids,
            tag_names = excluded.tag_names,
            attributes = excluded.attributes,
            price = excluded.price,
            sale_price = excluded.sale_price,
            stock_status = excluded.stock_status,
            published = excluded.published,
            total_sales = excluded.total_sales,
            average_rating = excluded.average_rating,
            review_count = excluded.review_count,
            featured = excluded.featured,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(item.item_id)
    .bind(&item.title)
    .bind(&item.body_text)
    .bind(&item.sku)
    .bind(serde_json::to_string(&item.category_names)?)
    .bind(serde_json::to_string(&item.category_ids)?)
    .bind(serde_json::to_string(&item.tag_names)?)
    .bind(serde_json::to_string(&item.attributes)?)
    .bind(item.price)
    .bind(item.sale_price)
    .bind(item.stock_status.as_str())
    .bind(item.published)
    .bind(item.total_sales)
    .bind(item.average_rating)
    .bind(item.review_count)
    .bind(item.featured)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

/// All catalog rows, decoded back into [`CatalogItem`]s.
pub async fn load_catalog_items(pool: &SqlitePool) -> Result<Vec<CatalogItem>> {
    use sqlx::Row;

    let rows = sqlx::query("SELECT * FROM catalog_items ORDER BY item_id").fetch_all(pool).await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let attributes: Vec<ItemAttribute> =
            serde_json::from_str(row.get::<String, _>("attributes").as_str()).unwrap_or_default();
        items.push(CatalogItem {
            item_id: row.get("item_id"),
            title: row.get("title"),
            body_text: row.get("body_text"),
            sku: row.get("sku"),
            category_names: serde_json::from_str(row.get::<String, _>("category_names").as_str())
                .unwrap_or_default(),
            category_ids: serde_json::from_str(row.get::<String, _>("category_ids").as_str())
                .unwrap_or_default(),
            tag_names: serde_json::from_str(row.get::<String, _>("tag_names").as_str())
                .unwrap_or_default(),
            attributes,
            price: row.get("price"),
            sale_price: row.get("sale_price"),
            stock_status: StockStatus::parse(row.get::<String, _>("stock_status").as_str()),
            published: row.get("published"),
            total_sales: row.get("total_sales"),
            average_rating: row.get("average_rating"),
            review_count: row.get("review_count"),
            featured: row.get("featured"),
        });
    }

    Ok(items)
}

/// Assemble the index record for a catalog item.
pub fn build_record(item: &CatalogItem, search_keywords: Vec<String>) -> IndexRecord {
    IndexRecord {
        item_id: item.item_id,
        title: item.title.clone(),
        body_text: item.body_text.clone(),
        sku: item.sku.clone(),
        category_names: item.category_names.clone(),
        category_ids: item.category_ids.clone(),
        tag_names: item.tag_names.clone(),
        attribute_text: item.attribute_text(),
        price: item.price,
        sale_price: item.sale_price,
        stock_status: item.stock_status,
        popularity_score: initial_popularity(item),
        search_keywords,
        last_updated: Utc::now(),
    }
}

async fn write_index_record(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    item: &CatalogItem,
) -> Result<()> {
    let mut keywords = base_keywords(item);

    if config.oracle.is_enabled() && config.oracle.keyword_generation {
        match oracle::product_keywords(oracle, &config.oracle, item).await {
            Ok(extra) => {
                let mut seen: std::collections::HashSet<String> =
                    keywords.iter().map(|k| k.to_lowercase()).collect();
                for kw in extra {
                    let kw = kw.trim().to_string();
                    if !kw.is_empty() && seen.insert(kw.to_lowercase()) {
                        keywords.push(kw);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "csx::index",
                    item = item.item_id,
                    error = %e,
                    "keyword augmentation failed, using base keywords"
                );
            }
        }
    }

    let record = build_record(item, keywords);
    let category_names = record.category_names.join(", ");
    let category_ids = record
        .category_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let tag_names = record.tag_names.join(", ");
    let search_keywords = record.search_keywords.join(", ");

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO search_index
            (item_id, title, body_text, sku, category_names, category_ids, tag_names,
             attribute_text, price, sale_price, stock_status, popularity_score,
             search_keywords, last_updated)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            title = excluded.title,
            body_text = excluded.body_text,
            sku = excluded.sku,
            category_names = excluded.category_names,
            category_ids = excluded.category_ids,
            tag_names = excluded.tag_names,
            attribute_text = excluded.attribute_text,
            price = excluded.price,
            sale_price = excluded.sale_price,
            stock_status = excluded.stock_status,
            popularity_score = excluded.popularity_score,
            search_keywords = excluded.search_keywords,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(record.item_id)
    .bind(&record.title)
    .bind(&record.body_text)
    .bind(&record.sku)
    .bind(&category_names)
    .bind(&category_ids)
    .bind(&tag_names)
    .bind(&record.attribute_text)
    .bind(record.price)
    .bind(record.sale_price)
    .bind(record.stock_status.as_str())
    .bind(record.popularity_score)
    .bind(&search_keywords)
    .bind(record.last_updated.timestamp())
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM search_index_fts WHERE item_id = ?")
        .bind(record.item_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO search_index_fts \
         (item_id, title, body_text, category_names, tag_names, attribute_text, search_keywords) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.item_id)
    .bind(&record.title)
    .bind(&record.body_text)
    .bind(&category_names)
    .bind(&tag_names)
    .bind(&record.attribute_text)
    .bind(&search_keywords)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn remove_index_row(pool: &SqlitePool, item_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM search_index WHERE item_id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM search_index_fts WHERE item_id = ?")
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}
