//! Shared fixtures for unit tests: a migrated temp database and catalog
//! item builders.

use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::config::Config;
use crate::models::{CatalogItem, StockStatus};
use crate::{db, migrate};

/// A minimal config pointing at a fresh temp database, already migrated.
pub async fn test_setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let config: Config = toml::from_str(&format!(
        "[db]\npath = \"{}/test.sqlite\"\n[server]\nbind = \"127.0.0.1:0\"\n",
        tmp.path().display()
    ))
    .unwrap();
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    (tmp, config, pool)
}

/// A published in-stock item with no sales history.
pub fn sample_item(item_id: i64, title: &str, price: f64) -> CatalogItem {
    CatalogItem {
        item_id,
        title: title.to_string(),
        body_text: format!("{title} description"),
        sku: None,
        category_names: Vec::new(),
        category_ids: Vec::new(),
        tag_names: Vec::new(),
        attributes: Vec::new(),
        price,
        sale_price: None,
        stock_status: StockStatus::InStock,
        published: true,
        total_sales: 0,
        average_rating: 0.0,
        review_count: 0,
        featured: false,
    }
}
