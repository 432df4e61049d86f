//! Core data models used throughout the engine.
//!
//! These types represent catalog items, index records, behavior events,
//! and the composite search response that flows through the query pipeline.
//! Loosely-typed payloads only exist at the HTTP/CLI boundary; everything
//! past the boundary is one of the records below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stock availability of a catalog item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Backorder,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "in_stock",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Backorder => "backorder",
        }
    }

    /// Parses the database representation. Unknown values default to
    /// `in_stock` so a schema drift never poisons the read path.
    pub fn parse(s: &str) -> StockStatus {
        match s {
            "out_of_stock" => StockStatus::OutOfStock,
            "backorder" => StockStatus::Backorder,
            _ => StockStatus::InStock,
        }
    }
}

/// A single product attribute as it arrives from the catalog
/// (e.g. `color: red, blue`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemAttribute {
    pub name: String,
    pub values: Vec<String>,
}

/// Raw sellable item as supplied by the catalog feed.
///
/// Stored verbatim in the `catalog_items` mirror table so `catalog rebuild`
/// can re-derive every index record without re-reading the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub item_id: i64,
    pub title: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub category_names: Vec<String>,
    #[serde(default)]
    pub category_ids: Vec<i64>,
    #[serde(default)]
    pub tag_names: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
    pub price: f64,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default = "default_stock_status")]
    pub stock_status: StockStatus,
    #[serde(default = "default_published")]
    pub published: bool,
    #[serde(default)]
    pub total_sales: i64,
    #[serde(default)]
    pub average_rating: f64,
    #[serde(default)]
    pub review_count: i64,
    #[serde(default)]
    pub featured: bool,
}

fn default_stock_status() -> StockStatus {
    StockStatus::InStock
}

fn default_published() -> bool {
    true
}

impl CatalogItem {
    /// Effective price a shopper would pay right now.
    pub fn effective_price(&self) -> f64 {
        self.sale_price.unwrap_or(self.price)
    }

    pub fn is_on_sale(&self) -> bool {
        matches!(self.sale_price, Some(sp) if sp < self.price)
    }

    /// Attributes flattened to `name: v1, v2` pairs for the text index.
    pub fn attribute_text(&self) -> String {
        self.attributes
            .iter()
            .map(|a| format!("{}: {}", a.name, a.values.join(", ")))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Derived, index-ready projection of a [`CatalogItem`].
///
/// One per sellable item. Holds the searchable text fields, pricing and
/// stock snapshot, the computed popularity score, and the augmented search
/// keywords written to the index tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub item_id: i64,
    pub title: String,
    pub body_text: String,
    pub sku: Option<String>,
    pub category_names: Vec<String>,
    pub category_ids: Vec<i64>,
    pub tag_names: Vec<String>,
    pub attribute_text: String,
    pub price: f64,
    pub sale_price: Option<f64>,
    pub stock_status: StockStatus,
    pub popularity_score: f64,
    pub search_keywords: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Kind of tracked user behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    View,
    AddToCart,
    Search,
    CategoryBrowse,
    Purchase,
    CartAbandon,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::View => "view",
            EventKind::AddToCart => "add_to_cart",
            EventKind::Search => "search",
            EventKind::CategoryBrowse => "category_browse",
            EventKind::Purchase => "purchase",
            EventKind::CartAbandon => "cart_abandon",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "view" => Some(EventKind::View),
            "add_to_cart" => Some(EventKind::AddToCart),
            "search" => Some(EventKind::Search),
            "category_browse" => Some(EventKind::CategoryBrowse),
            "purchase" => Some(EventKind::Purchase),
            "cart_abandon" => Some(EventKind::CartAbandon),
            _ => None,
        }
    }

    /// Bounded history window per actor for this kind of event.
    /// Older entries are trimmed on append.
    pub fn window(&self) -> i64 {
        match self {
            EventKind::View => 50,
            EventKind::Search => 20,
            _ => 100,
        }
    }
}

/// An append-only behavior log entry read back from the store.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: String,
    pub actor_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One purchased line inside a `purchase` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub item_id: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub categories: Vec<String>,
}

fn default_quantity() -> i64 {
    1
}

/// Typed view of a `purchase` event payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurchasePayload {
    #[serde(default)]
    pub order_total: f64,
    #[serde(default)]
    pub discount_total: f64,
    #[serde(default)]
    pub coupon_used: bool,
    #[serde(default)]
    pub items: Vec<PurchaseLine>,
}

/// Where a query suggestion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// A prior query other shoppers ran, ranked by frequency.
    Popular,
    /// An indexed product title, ranked by popularity.
    Product,
    /// Produced by the suggestion oracle.
    Oracle,
}

/// A single query completion offered to the shopper.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub text: String,
    pub kind: SuggestionKind,
    /// Source-native weight: search frequency, popularity score, or a
    /// fixed oracle confidence. Only comparable within one kind.
    pub weight: f64,
}

/// A predicted product category with a confidence in `[0, 1]`.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryPrediction {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub item_count: i64,
    pub confidence: f64,
}

/// A retrieved product after personalization.
#[derive(Debug, Clone, Serialize)]
pub struct RankedProduct {
    pub item_id: i64,
    pub title: String,
    pub price: f64,
    pub sale_price: Option<f64>,
    pub stock_status: StockStatus,
    pub categories: Vec<String>,
    pub popularity_score: f64,
    /// Provider-native full-text relevance.
    pub relevance_score: f64,
    /// Relevance after the actor-specific multipliers.
    pub personalized_score: f64,
    /// True when personalization raised this item above its raw relevance.
    pub personalized: bool,
}

/// Classified intent of a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Purchase,
    Research,
    Support,
    Browse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    High,
    Normal,
}

/// Lightweight keyword-derived insights about a query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryInsights {
    pub intent: Intent,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    /// Merchandising notes derived from intent/urgency.
    pub notes: Vec<String>,
}

/// A segment an actor currently matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedSegment {
    pub key: String,
    pub name: String,
    pub priority: i64,
    pub matched_at: DateTime<Utc>,
}

/// Composite result of one predictive-search call.
///
/// Always well-formed: a failed sub-step leaves its field empty rather
/// than surfacing an error, and a too-short query returns the whole
/// response empty with `processed = false`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub processed: bool,
    pub spell_correction: Option<String>,
    pub suggestions: Vec<Suggestion>,
    pub categories: Vec<CategoryPrediction>,
    pub products: Vec<RankedProduct>,
    pub related_searches: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<QueryInsights>,
}

impl SearchResponse {
    /// The fail-soft result for unprocessable input.
    pub fn unprocessed(query: &str) -> SearchResponse {
        SearchResponse {
            query: query.to_string(),
            processed: false,
            spell_correction: None,
            suggestions: Vec::new(),
            categories: Vec::new(),
            products: Vec::new(),
            related_searches: Vec::new(),
            insights: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_status_roundtrip() {
        for s in [
            StockStatus::InStock,
            StockStatus::OutOfStock,
            StockStatus::Backorder,
        ] {
            assert_eq!(StockStatus::parse(s.as_str()), s);
        }
        assert_eq!(StockStatus::parse("garbage"), StockStatus::InStock);
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for k in [
            EventKind::View,
            EventKind::AddToCart,
            EventKind::Search,
            EventKind::CategoryBrowse,
            EventKind::Purchase,
            EventKind::CartAbandon,
        ] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(EventKind::parse("unknown"), None);
    }

    #[test]
    fn test_effective_price_prefers_sale() {
        let mut item = sample_item();
        assert_eq!(item.effective_price(), 80.0);
        assert!(item.is_on_sale());
        item.sale_price = None;
        assert_eq!(item.effective_price(), 100.0);
        assert!(!item.is_on_sale());
    }

    #[test]
    fn test_attribute_text_flattens_pairs() {
        let item = sample_item();
        assert_eq!(item.attribute_text(), "color: red, blue, size: M");
    }

    #[test]
    fn test_catalog_item_minimal_json() {
        let item: CatalogItem =
            serde_json::from_str(r#"{"item_id": 7, "title": "Mug", "price": 9.5}"#).unwrap();
        assert_eq!(item.item_id, 7);
        assert_eq!(item.stock_status, StockStatus::InStock);
        assert!(item.published);
        assert!(item.category_names.is_empty());
    }

    fn sample_item() -> CatalogItem {
        CatalogItem {
            item_id: 1,
            title: "Test Shirt".into(),
            body_text: String::new(),
            sku: None,
            category_names: vec![],
            category_ids: vec![],
            tag_names: vec![],
            attributes: vec![
                ItemAttribute {
                    name: "color".into(),
                    values: vec!["red".into(), "blue".into()],
                },
                ItemAttribute {
                    name: "size".into(),
                    values: vec!["M".into()],
                },
            ],
            price: 100.0,
            sale_price: Some(80.0),
            stock_status: StockStatus::InStock,
            published: true,
            total_sales: 0,
            average_rating: 0.0,
            review_count: 0,
            featured: false,
        }
    }
}
