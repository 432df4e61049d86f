//! Rule-driven user segmentation.
//!
//! Segments are named cohorts defined by `field <op> threshold` rules over
//! a [`UserProfile`]. Definitions stay data-driven (built-in defaults,
//! overridable from the config file) while evaluation is a single
//! exhaustive match over a typed operator enum.
//!
//! Matching is permissive: a rule whose field names a metric this engine
//! does not compute is treated as satisfied, not failed. That mirrors the
//! production behavior this engine was distilled from; change it
//! deliberately, not in passing.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::config::{SegmentConfig, SegmentRuleConfig};
use crate::models::MatchedSegment;
use crate::profile::{self, ProfileField, UserProfile};

/// Comparison operator for a segment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl RuleOp {
    pub fn parse(s: &str) -> Option<RuleOp> {
        match s {
            "=" => Some(RuleOp::Eq),
            ">" => Some(RuleOp::Gt),
            "<" => Some(RuleOp::Lt),
            ">=" => Some(RuleOp::Ge),
            "<=" => Some(RuleOp::Le),
            _ => None,
        }
    }

    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            RuleOp::Eq => (value - threshold).abs() < 1e-9,
            RuleOp::Gt => value > threshold,
            RuleOp::Lt => value < threshold,
            RuleOp::Ge => value >= threshold,
            RuleOp::Le => value <= threshold,
        }
    }
}

/// One rule of a segment definition.
///
/// `field` is kept as the raw configured name; resolution to a
/// [`ProfileField`] happens at evaluation so unknown fields can fall
/// through to the permissive-match path.
#[derive(Debug, Clone)]
pub struct SegmentRule {
    pub field: String,
    pub op: RuleOp,
    pub threshold: f64,
}

impl SegmentRule {
    /// A rule matches when its metric satisfies the comparison — or when
    /// the field is unknown to the profile (permissive policy).
    pub fn matches(&self, profile: &UserProfile) -> bool {
        match ProfileField::parse(&self.field) {
            Some(field) => self.op.compare(profile.metric(field), self.threshold),
            None => true,
        }
    }
}

/// A named segment: all rules must match.
#[derive(Debug, Clone)]
pub struct SegmentDef {
    pub key: String,
    pub name: String,
    pub priority: i64,
    pub rules: Vec<SegmentRule>,
}

impl SegmentDef {
    pub fn matches(&self, profile: &UserProfile) -> bool {
        self.rules.iter().all(|r| r.matches(profile))
    }
}

fn rule(field: &str, op: RuleOp, threshold: f64) -> SegmentRule {
    SegmentRule {
        field: field.to_string(),
        op,
        threshold,
    }
}

fn segment(key: &str, name: &str, priority: i64, rules: Vec<SegmentRule>) -> SegmentDef {
    SegmentDef {
        key: key.to_string(),
        name: name.to_string(),
        priority,
        rules,
    }
}

/// The built-in segment set.
pub fn default_segments() -> Vec<SegmentDef> {
    vec![
        segment(
            "new_visitor",
            "New Visitor",
            1,
            vec![
                rule("visit_count", RuleOp::Eq, 1.0),
                rule("order_count", RuleOp::Eq, 0.0),
            ],
        ),
        segment(
            "browser",
            "Browser",
            2,
            vec![
                rule("visit_count", RuleOp::Gt, 3.0),
                rule("order_count", RuleOp::Eq, 0.0),
                rule("product_views", RuleOp::Gt, 5.0),
            ],
        ),
        segment(
            "first_time_buyer",
            "First Time Buyer",
            3,
            vec![
                rule("order_count", RuleOp::Eq, 1.0),
                rule("days_since_first_order", RuleOp::Lt, 30.0),
            ],
        ),
        segment(
            "repeat_customer",
            "Repeat Customer",
            4,
            vec![
                rule("order_count", RuleOp::Ge, 2.0),
                rule("order_count", RuleOp::Lt, 5.0),
            ],
        ),
        segment(
            "vip_customer",
            "VIP Customer",
            5,
            vec![
                rule("order_count", RuleOp::Ge, 5.0),
                rule("total_spent", RuleOp::Gt, 1000.0),
            ],
        ),
        segment(
            "at_risk",
            "At Risk",
            6,
            vec![
                rule("order_count", RuleOp::Gt, 0.0),
                rule("days_since_last_order", RuleOp::Gt, 90.0),
            ],
        ),
        segment(
            "win_back",
            "Win Back",
            7,
            vec![
                rule("order_count", RuleOp::Gt, 0.0),
                rule("days_since_last_order", RuleOp::Gt, 180.0),
            ],
        ),
        segment(
            "high_intent",
            "High Intent",
            8,
            vec![
                rule("cart_abandonment_count", RuleOp::Gt, 0.0),
                rule("product_views_last_7_days", RuleOp::Gt, 10.0),
            ],
        ),
        segment(
            "bargain_hunter",
            "Bargain Hunter",
            9,
            vec![
                rule("coupon_usage_rate", RuleOp::Gt, 0.7),
                rule("avg_discount_percent", RuleOp::Gt, 20.0),
            ],
        ),
        segment(
            "category_enthusiast",
            "Category Enthusiast",
            10,
            vec![
                rule("category_concentration", RuleOp::Gt, 0.8),
                rule("category_purchase_count", RuleOp::Gt, 3.0),
            ],
        ),
    ]
}

/// Resolve the effective segment set: config-defined when present,
/// built-ins otherwise.
pub fn resolve_segments(configured: &[SegmentConfig]) -> Vec<SegmentDef> {
    if configured.is_empty() {
        return default_segments();
    }

    configured
        .iter()
        .map(|sc| SegmentDef {
            key: sc.key.clone(),
            name: sc.name.clone().unwrap_or_else(|| sc.key.clone()),
            priority: sc.priority,
            rules: sc.rules.iter().map(rule_from_config).collect(),
        })
        .collect()
}

fn rule_from_config(rc: &SegmentRuleConfig) -> SegmentRule {
    SegmentRule {
        field: rc.field.clone(),
        // Operators were validated at config load; Ge is the safe fallback.
        op: RuleOp::parse(&rc.op).unwrap_or(RuleOp::Ge),
        threshold: rc.threshold,
    }
}

/// Evaluate all definitions against a profile.
///
/// Returns fully-matching segments sorted by priority descending; ties
/// keep declaration order (the sort is stable). The head is the primary
/// segment.
pub fn compute_segments(profile: &UserProfile, defs: &[SegmentDef]) -> Vec<MatchedSegment> {
    let matched_at = Utc::now();
    let mut matched: Vec<MatchedSegment> = defs
        .iter()
        .filter(|d| d.matches(profile))
        .map(|d| MatchedSegment {
            key: d.key.clone(),
            name: d.name.clone(),
            priority: d.priority,
            matched_at,
        })
        .collect();

    matched.sort_by(|a, b| b.priority.cmp(&a.priority));
    matched
}

/// The primary segment key, defaulting to `new_visitor` when nothing
/// matched (an actor is always addressable by some segment).
pub fn primary_key(matched: &[MatchedSegment]) -> String {
    matched
        .first()
        .map(|m| m.key.clone())
        .unwrap_or_else(|| "new_visitor".to_string())
}

/// Recompute an actor's segments from their current profile and persist
/// the result. Emits a "segments updated" event for downstream consumers.
pub async fn compute_and_store(
    pool: &SqlitePool,
    defs: &[SegmentDef],
    actor_id: &str,
) -> Result<Vec<MatchedSegment>> {
    let profile = profile::build_profile(pool, actor_id).await?;
    let matched = compute_segments(&profile, defs);
    let primary = primary_key(&matched);

    sqlx::query(
        r#"
        INSERT INTO actor_segments (actor_id, segments_json, primary_segment, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(actor_id) DO UPDATE SET
            segments_json = excluded.segments_json,
            primary_segment = excluded.primary_segment,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(actor_id)
    .bind(serde_json::to_string(&matched)?)
    .bind(&primary)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    tracing::info!(
        target: "csx::segments",
        actor = actor_id,
        primary = %primary,
        matched = matched.len(),
        "segments updated"
    );

    Ok(matched)
}

/// Load the stored segment assignment, computing it on first access.
pub async fn load_or_compute(
    pool: &SqlitePool,
    defs: &[SegmentDef],
    actor_id: &str,
) -> Result<(Vec<MatchedSegment>, String)> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT segments_json, primary_segment FROM actor_segments WHERE actor_id = ?",
    )
    .bind(actor_id)
    .fetch_optional(pool)
    .await?;

    if let Some((json, primary)) = row {
        let matched: Vec<MatchedSegment> = serde_json::from_str(&json).unwrap_or_default();
        return Ok((matched, primary));
    }

    let matched = compute_and_store(pool, defs, actor_id).await?;
    let primary = primary_key(&matched);
    Ok((matched, primary))
}

/// Outcome of one segment sweep run.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub recomputed: u64,
}

/// Recompute segments for actors whose assignment is missing or older
/// than `ttl_secs`, bounded to `batch_limit` actors per run.
pub async fn sweep(
    pool: &SqlitePool,
    defs: &[SegmentDef],
    ttl_secs: i64,
    batch_limit: i64,
) -> Result<SweepOutcome> {
    let cutoff = Utc::now().timestamp() - ttl_secs;

    let actors: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT e.actor_id
        FROM behavior_events e
        LEFT JOIN actor_segments s ON s.actor_id = e.actor_id
        WHERE s.actor_id IS NULL OR s.updated_at < ?
        ORDER BY e.actor_id
        LIMIT ?
        "#,
    )
    .bind(cutoff)
    .bind(batch_limit)
    .fetch_all(pool)
    .await?;

    let mut outcome = SweepOutcome::default();
    for actor in &actors {
        compute_and_store(pool, defs, actor).await?;
        outcome.recomputed += 1;
    }

    tracing::debug!(
        target: "csx::segments",
        recomputed = outcome.recomputed,
        "segment sweep complete"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{profile_from_events, PriceRange, DAYS_NEVER};
    use std::collections::HashMap;

    fn empty_profile() -> UserProfile {
        profile_from_events(&[], Utc::now())
    }

    fn profile_with(f: impl FnOnce(&mut UserProfile)) -> UserProfile {
        let mut p = empty_profile();
        f(&mut p);
        p
    }

    #[test]
    fn test_rule_op_compare() {
        assert!(RuleOp::Eq.compare(3.0, 3.0));
        assert!(!RuleOp::Eq.compare(3.0, 4.0));
        assert!(RuleOp::Gt.compare(4.0, 3.0));
        assert!(!RuleOp::Gt.compare(3.0, 3.0));
        assert!(RuleOp::Lt.compare(2.0, 3.0));
        assert!(RuleOp::Ge.compare(3.0, 3.0));
        assert!(RuleOp::Le.compare(3.0, 3.0));
        assert!(!RuleOp::Le.compare(4.0, 3.0));
    }

    #[test]
    fn test_rule_op_parse() {
        assert_eq!(RuleOp::parse(">="), Some(RuleOp::Ge));
        assert_eq!(RuleOp::parse("!="), None);
    }

    #[test]
    fn test_unknown_field_matches_permissively() {
        let r = rule("loyalty_tier", RuleOp::Gt, 99.0);
        assert!(r.matches(&empty_profile()));
    }

    #[test]
    fn test_new_visitor_matches_empty_profile() {
        let defs = default_segments();
        let matched = compute_segments(&empty_profile(), &defs);
        assert_eq!(primary_key(&matched), "new_visitor");
    }

    #[test]
    fn test_vip_profile() {
        let p = profile_with(|p| {
            p.order_count = 6;
            p.total_spent = 1500.0;
            p.days_since_first_order = 200;
            p.days_since_last_order = 10;
        });
        let matched = compute_segments(&p, &default_segments());
        let keys: Vec<&str> = matched.iter().map(|m| m.key.as_str()).collect();
        assert!(keys.contains(&"vip_customer"));
        assert!(!keys.contains(&"first_time_buyer"));
    }

    #[test]
    fn test_priority_orders_matches() {
        // Matches at_risk (6) and win_back (7): win_back is primary
        let p = profile_with(|p| {
            p.order_count = 3;
            p.days_since_first_order = 400;
            p.days_since_last_order = 200;
        });
        let matched = compute_segments(&p, &default_segments());
        assert_eq!(primary_key(&matched), "win_back");
        let keys: Vec<&str> = matched.iter().map(|m| m.key.as_str()).collect();
        assert!(keys.contains(&"at_risk"));
        assert!(keys.contains(&"repeat_customer"));
    }

    #[test]
    fn test_higher_priority_wins() {
        // A (priority 3) and B (priority 7) both match: B is primary
        let defs = vec![
            segment("a", "A", 3, vec![]),
            segment("b", "B", 7, vec![]),
        ];
        let matched = compute_segments(&empty_profile(), &defs);
        assert_eq!(primary_key(&matched), "b");
    }

    #[test]
    fn test_tie_keeps_declaration_order() {
        let defs = vec![
            segment("first", "First", 5, vec![]),
            segment("second", "Second", 5, vec![]),
        ];
        let matched = compute_segments(&empty_profile(), &defs);
        assert_eq!(primary_key(&matched), "first");
    }

    #[test]
    fn test_repeat_customer_band() {
        let defs = default_segments();
        let in_band = profile_with(|p| {
            p.order_count = 3;
            p.days_since_first_order = 10;
            p.days_since_last_order = 5;
        });
        let above = profile_with(|p| {
            p.order_count = 5;
            p.days_since_first_order = 10;
            p.days_since_last_order = 5;
        });
        let keys = |p: &UserProfile| -> Vec<String> {
            compute_segments(p, &defs).iter().map(|m| m.key.clone()).collect()
        };
        assert!(keys(&in_band).contains(&"repeat_customer".to_string()));
        assert!(!keys(&above).contains(&"repeat_customer".to_string()));
    }

    #[test]
    fn test_bargain_hunter() {
        let p = profile_with(|p| {
            p.order_count = 4;
            p.coupon_usage_rate = 0.8;
            p.avg_discount_percent = 25.0;
            p.days_since_first_order = 50;
            p.days_since_last_order = 5;
        });
        let matched = compute_segments(&p, &default_segments());
        assert_eq!(primary_key(&matched), "bargain_hunter");
    }

    #[test]
    fn test_day_count_sentinel_blocks_recency_segments() {
        // No orders: at_risk/win_back require order_count > 0 and stay out
        let p = profile_with(|p| {
            p.days_since_first_order = DAYS_NEVER;
            p.days_since_last_order = DAYS_NEVER;
        });
        let matched = compute_segments(&p, &default_segments());
        let keys: Vec<&str> = matched.iter().map(|m| m.key.as_str()).collect();
        assert!(!keys.contains(&"at_risk"));
        assert!(!keys.contains(&"win_back"));
    }

    #[test]
    fn test_resolve_segments_prefers_config() {
        let configured = vec![SegmentConfig {
            key: "whale".to_string(),
            name: None,
            priority: 42,
            rules: vec![SegmentRuleConfig {
                field: "total_spent".to_string(),
                op: ">".to_string(),
                threshold: 10_000.0,
            }],
        }];
        let defs = resolve_segments(&configured);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "whale");
        assert_eq!(defs[0].rules[0].op, RuleOp::Gt);

        assert_eq!(resolve_segments(&[]).len(), 10);
    }

    #[test]
    fn test_category_enthusiast_needs_both_rules() {
        let mut counts = HashMap::new();
        counts.insert("Shoes".to_string(), 5i64);
        let p = profile_with(|p| {
            p.order_count = 5;
            p.total_spent = 100.0;
            p.category_concentration = 1.0;
            p.category_purchase_count = 5;
            p.category_purchase_counts = counts;
            p.days_since_first_order = 50;
            p.days_since_last_order = 5;
            p.preferred_price_range = PriceRange { min: 10.0, max: 30.0 };
        });
        let matched = compute_segments(&p, &default_segments());
        assert_eq!(primary_key(&matched), "category_enthusiast");
    }
}
