//! Derived user profiles.
//!
//! A [`UserProfile`] is recomputed from the behavior event log every time
//! it is needed — never incrementally mutated — so it cannot drift from
//! the events that define it. Fields that cannot be computed resolve to a
//! neutral default (0, or `i64::MAX` for day-counts) instead of erroring.

use anyhow::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::behavior;
use crate::models::{EventKind, PurchasePayload, StoredEvent};

/// Sentinel for "no order history yet": any `days_since_*` rule reads it
/// as effectively infinite.
pub const DAYS_NEVER: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.min && price <= self.max
    }
}

/// Aggregates derived from an actor's behavior and order history.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub visit_count: i64,
    pub order_count: i64,
    pub total_spent: f64,
    pub avg_order_value: f64,
    pub product_views: i64,
    pub product_views_last_7_days: i64,
    pub days_since_first_order: i64,
    pub days_since_last_order: i64,
    pub cart_abandonment_count: i64,
    pub coupon_usage_rate: f64,
    pub avg_discount_percent: f64,
    /// Share of purchases concentrated in the single largest category.
    pub category_concentration: f64,
    /// Purchase count of the largest category.
    pub category_purchase_count: i64,
    pub category_purchase_counts: HashMap<String, i64>,
    pub preferred_price_range: PriceRange,
    pub preferred_device: String,
    pub preferred_time_of_day: String,
}

/// Profile metrics addressable from data-driven segment rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    VisitCount,
    OrderCount,
    TotalSpent,
    AvgOrderValue,
    ProductViews,
    ProductViewsLast7Days,
    DaysSinceFirstOrder,
    DaysSinceLastOrder,
    CartAbandonmentCount,
    CouponUsageRate,
    AvgDiscountPercent,
    CategoryConcentration,
    CategoryPurchaseCount,
}

impl ProfileField {
    /// Maps a rule's field name to a metric this engine computes.
    /// Unknown names return `None`; rule evaluation treats those as
    /// vacuously satisfied (the permissive-matching policy).
    pub fn parse(s: &str) -> Option<ProfileField> {
        match s {
            "visit_count" => Some(ProfileField::VisitCount),
            "order_count" => Some(ProfileField::OrderCount),
            "total_spent" => Some(ProfileField::TotalSpent),
            "avg_order_value" => Some(ProfileField::AvgOrderValue),
            "product_views" => Some(ProfileField::ProductViews),
            "product_views_last_7_days" => Some(ProfileField::ProductViewsLast7Days),
            "days_since_first_order" => Some(ProfileField::DaysSinceFirstOrder),
            "days_since_last_order" => Some(ProfileField::DaysSinceLastOrder),
            "cart_abandonment_count" => Some(ProfileField::CartAbandonmentCount),
            "coupon_usage_rate" => Some(ProfileField::CouponUsageRate),
            "avg_discount_percent" => Some(ProfileField::AvgDiscountPercent),
            "category_concentration" => Some(ProfileField::CategoryConcentration),
            "category_purchase_count" => Some(ProfileField::CategoryPurchaseCount),
            _ => None,
        }
    }
}

impl UserProfile {
    pub fn metric(&self, field: ProfileField) -> f64 {
        match field {
            ProfileField::VisitCount => self.visit_count as f64,
            ProfileField::OrderCount => self.order_count as f64,
            ProfileField::TotalSpent => self.total_spent,
            ProfileField::AvgOrderValue => self.avg_order_value,
            ProfileField::ProductViews => self.product_views as f64,
            ProfileField::ProductViewsLast7Days => self.product_views_last_7_days as f64,
            ProfileField::DaysSinceFirstOrder => self.days_since_first_order as f64,
            ProfileField::DaysSinceLastOrder => self.days_since_last_order as f64,
            ProfileField::CartAbandonmentCount => self.cart_abandonment_count as f64,
            ProfileField::CouponUsageRate => self.coupon_usage_rate,
            ProfileField::AvgDiscountPercent => self.avg_discount_percent,
            ProfileField::CategoryConcentration => self.category_concentration,
            ProfileField::CategoryPurchaseCount => self.category_purchase_count as f64,
        }
    }

    /// Top categories by purchase count, most purchased first.
    pub fn preferred_categories(&self, limit: usize) -> Vec<String> {
        let mut pairs: Vec<(&String, &i64)> = self.category_purchase_counts.iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        pairs.into_iter().take(limit).map(|(k, _)| k.clone()).collect()
    }
}

/// Build the profile for an actor from their event log.
pub async fn build_profile(pool: &SqlitePool, actor_id: &str) -> Result<UserProfile> {
    let events = behavior::fetch_events(pool, actor_id).await?;
    Ok(profile_from_events(&events, Utc::now()))
}

/// Pure aggregation over an event window. `now` is injected so recency
/// metrics are deterministic under test.
pub fn profile_from_events(events: &[StoredEvent], now: DateTime<Utc>) -> UserProfile {
    let mut visit_days: HashMap<(i32, u32, u32), ()> = HashMap::new();
    let mut product_views = 0i64;
    let mut product_views_last_7_days = 0i64;
    let mut cart_abandonment_count = 0i64;
    let mut device_counts: HashMap<String, i64> = HashMap::new();
    let mut hour_counts: HashMap<u32, i64> = HashMap::new();

    let mut order_count = 0i64;
    let mut total_spent = 0.0f64;
    let mut total_discount = 0.0f64;
    let mut total_subtotal = 0.0f64;
    let mut coupon_orders = 0i64;
    let mut first_order: Option<DateTime<Utc>> = None;
    let mut last_order: Option<DateTime<Utc>> = None;
    let mut category_purchase_counts: HashMap<String, i64> = HashMap::new();

    let week_ago = now - chrono::Duration::days(7);

    for ev in events {
        let d = ev.created_at;
        visit_days.insert((d.year(), d.month(), d.day()), ());
        *hour_counts.entry(d.hour()).or_insert(0) += 1;
        if let Some(device) = &ev.device {
            *device_counts.entry(device.clone()).or_insert(0) += 1;
        }

        match ev.kind {
            EventKind::View => {
                product_views += 1;
                if ev.created_at > week_ago {
                    product_views_last_7_days += 1;
                }
            }
            EventKind::CartAbandon => cart_abandonment_count += 1,
            EventKind::Purchase => {
                let payload: PurchasePayload =
                    serde_json::from_value(ev.payload.clone()).unwrap_or_default();

                order_count += 1;
                total_spent += payload.order_total;
                total_discount += payload.discount_total;
                total_subtotal += payload.order_total + payload.discount_total;
                if payload.coupon_used {
                    coupon_orders += 1;
                }
                if first_order.map_or(true, |f| ev.created_at < f) {
                    first_order = Some(ev.created_at);
                }
                if last_order.map_or(true, |l| ev.created_at > l) {
                    last_order = Some(ev.created_at);
                }
                for line in &payload.items {
                    for cat in &line.categories {
                        *category_purchase_counts.entry(cat.clone()).or_insert(0) += 1;
                    }
                }
            }
            EventKind::AddToCart | EventKind::Search | EventKind::CategoryBrowse => {}
        }
    }

    let avg_order_value = if order_count > 0 {
        total_spent / order_count as f64
    } else {
        0.0
    };

    let coupon_usage_rate = if order_count > 0 {
        coupon_orders as f64 / order_count as f64
    } else {
        0.0
    };

    let avg_discount_percent = if total_subtotal > 0.0 {
        (total_discount / total_subtotal) * 100.0
    } else {
        0.0
    };

    let total_category_purchases: i64 = category_purchase_counts.values().sum();
    let category_purchase_count = category_purchase_counts.values().copied().max().unwrap_or(0);
    let category_concentration = if total_category_purchases > 0 {
        category_purchase_count as f64 / total_category_purchases as f64
    } else {
        0.0
    };

    let preferred_price_range = if avg_order_value > 0.0 {
        PriceRange {
            min: avg_order_value * 0.5,
            max: avg_order_value * 1.5,
        }
    } else {
        PriceRange { min: 0.0, max: 100.0 }
    };

    UserProfile {
        // At least one visit: being profiled implies the actor showed up.
        visit_count: (visit_days.len() as i64).max(1),
        order_count,
        total_spent,
        avg_order_value,
        product_views,
        product_views_last_7_days,
        days_since_first_order: days_since(first_order, now),
        days_since_last_order: days_since(last_order, now),
        cart_abandonment_count,
        coupon_usage_rate,
        avg_discount_percent,
        category_concentration,
        category_purchase_count,
        category_purchase_counts,
        preferred_price_range,
        preferred_device: modal_key(&device_counts).unwrap_or_else(|| "unknown".to_string()),
        preferred_time_of_day: modal_key(&hour_counts)
            .map(time_of_day)
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn days_since(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    match ts {
        Some(t) => (now - t).num_days().max(0),
        None => DAYS_NEVER,
    }
}

fn modal_key<K: Clone + Ord>(counts: &HashMap<K, i64>) -> Option<K> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(k, _)| k.clone())
}

fn time_of_day(hour: u32) -> String {
    match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
    .to_string()
}

/// Per-request actor state handed to the ranking and prediction steps.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor_id: Option<String>,
    pub primary_segment: String,
    pub preferred_categories: Vec<String>,
    pub price_range: PriceRange,
    pub recently_viewed: Vec<i64>,
}

impl ActorContext {
    /// Context for anonymous traffic: no history, wide price range.
    pub fn guest() -> ActorContext {
        ActorContext {
            actor_id: None,
            primary_segment: "new_visitor".to_string(),
            preferred_categories: Vec::new(),
            price_range: PriceRange { min: 0.0, max: 1000.0 },
            recently_viewed: Vec::new(),
        }
    }
}

/// Assemble the actor context used to personalize a query.
///
/// Reads the stored primary segment (defaulting to `new_visitor` when the
/// actor has never been segmented) rather than recomputing it on the hot
/// path; segment recomputation happens on behavior triggers and sweeps.
pub async fn build_actor_context(pool: &SqlitePool, actor_id: Option<&str>) -> Result<ActorContext> {
    let Some(actor) = actor_id else {
        return Ok(ActorContext::guest());
    };

    let profile = build_profile(pool, actor).await?;

    let primary_segment: Option<String> =
        sqlx::query_scalar("SELECT primary_segment FROM actor_segments WHERE actor_id = ?")
            .bind(actor)
            .fetch_optional(pool)
            .await?;

    let recently_viewed = behavior::recent_view_ids(pool, actor, 10).await?;

    Ok(ActorContext {
        actor_id: Some(actor.to_string()),
        primary_segment: primary_segment.unwrap_or_else(|| "new_visitor".to_string()),
        preferred_categories: profile.preferred_categories(3),
        price_range: profile.preferred_price_range,
        recently_viewed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn event(kind: EventKind, payload: serde_json::Value, when: DateTime<Utc>) -> StoredEvent {
        StoredEvent {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: "u1".to_string(),
            kind,
            payload,
            device: Some("mobile".to_string()),
            created_at: when,
        }
    }

    fn purchase(total: f64, discount: f64, coupon: bool, cats: &[&str], when: DateTime<Utc>) -> StoredEvent {
        event(
            EventKind::Purchase,
            json!({
                "order_total": total,
                "discount_total": discount,
                "coupon_used": coupon,
                "items": [{"item_id": 1, "quantity": 1, "price": total, "categories": cats}],
            }),
            when,
        )
    }

    #[test]
    fn test_empty_history_neutral_defaults() {
        let p = profile_from_events(&[], at(20, 12));
        assert_eq!(p.order_count, 0);
        assert_eq!(p.visit_count, 1);
        assert_eq!(p.days_since_first_order, DAYS_NEVER);
        assert_eq!(p.days_since_last_order, DAYS_NEVER);
        assert_eq!(p.coupon_usage_rate, 0.0);
        assert_eq!(p.preferred_price_range, PriceRange { min: 0.0, max: 100.0 });
        assert_eq!(p.preferred_device, "unknown");
        assert_eq!(p.preferred_time_of_day, "unknown");
    }

    #[test]
    fn test_order_aggregates() {
        let events = vec![
            purchase(100.0, 0.0, false, &["Shoes"], at(1, 10)),
            purchase(200.0, 50.0, true, &["Shoes", "Apparel"], at(10, 9)),
        ];
        let p = profile_from_events(&events, at(20, 12));

        assert_eq!(p.order_count, 2);
        assert_eq!(p.total_spent, 300.0);
        assert_eq!(p.avg_order_value, 150.0);
        assert_eq!(p.days_since_first_order, 19);
        assert_eq!(p.days_since_last_order, 10);
        assert_eq!(p.coupon_usage_rate, 0.5);
        // 50 discount over 350 subtotal
        assert!((p.avg_discount_percent - 100.0 * 50.0 / 350.0).abs() < 1e-9);
        assert_eq!(p.category_purchase_counts["Shoes"], 2);
        assert_eq!(p.category_purchase_count, 2);
        assert!((p.category_concentration - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(p.preferred_price_range, PriceRange { min: 75.0, max: 225.0 });
    }

    #[test]
    fn test_view_windows() {
        let events = vec![
            event(EventKind::View, json!({"item_id": 1}), at(1, 9)),
            event(EventKind::View, json!({"item_id": 2}), at(19, 9)),
            event(EventKind::View, json!({"item_id": 3}), at(19, 10)),
        ];
        let p = profile_from_events(&events, at(20, 12));
        assert_eq!(p.product_views, 3);
        assert_eq!(p.product_views_last_7_days, 2);
    }

    #[test]
    fn test_preferred_categories_ordering() {
        let events = vec![
            purchase(10.0, 0.0, false, &["A"], at(1, 9)),
            purchase(10.0, 0.0, false, &["B"], at(2, 9)),
            purchase(10.0, 0.0, false, &["B"], at(3, 9)),
            purchase(10.0, 0.0, false, &["C"], at(4, 9)),
        ];
        let p = profile_from_events(&events, at(20, 12));
        assert_eq!(p.preferred_categories(2), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_time_of_day_buckets() {
        assert_eq!(time_of_day(6), "morning");
        assert_eq!(time_of_day(13), "afternoon");
        assert_eq!(time_of_day(18), "evening");
        assert_eq!(time_of_day(23), "night");
        assert_eq!(time_of_day(2), "night");
    }

    #[test]
    fn test_malformed_purchase_payload_is_neutral() {
        let events = vec![event(EventKind::Purchase, json!("not an object"), at(1, 9))];
        let p = profile_from_events(&events, at(20, 12));
        // Counted as an order with zeroed amounts, not an error
        assert_eq!(p.order_count, 1);
        assert_eq!(p.total_spent, 0.0);
    }

    #[test]
    fn test_profile_field_parse_unknown() {
        assert_eq!(ProfileField::parse("order_count"), Some(ProfileField::OrderCount));
        assert_eq!(ProfileField::parse("shoe_size"), None);
    }
}
