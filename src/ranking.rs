//! Full-text retrieval and personalized re-ranking.
//!
//! Retrieval matches the query against the indexed text columns via FTS5
//! and takes the provider's BM25 ranking as the base relevance. Each hit
//! is then re-scored with actor-specific multipliers (price fit, category
//! affinity, repeat-view penalty, segment bonuses) and the final order is
//! deterministic: personalized score desc, popularity desc, item id asc.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::{Config, RankingConfig};
use crate::models::{RankedProduct, StockStatus};
use crate::profile::ActorContext;

/// A retrieved index hit before personalization.
#[derive(Debug, Clone)]
pub struct RetrievedItem {
    pub item_id: i64,
    pub title: String,
    pub price: f64,
    pub sale_price: Option<f64>,
    pub stock_status: StockStatus,
    pub categories: Vec<String>,
    pub popularity_score: f64,
    pub relevance_score: f64,
}

impl RetrievedItem {
    fn effective_price(&self) -> f64 {
        self.sale_price.unwrap_or(self.price)
    }

    fn is_on_sale(&self) -> bool {
        matches!(self.sale_price, Some(sp) if sp < self.price)
    }
}

/// Build an FTS5 MATCH expression from free-form user input.
///
/// Each alphanumeric token is quoted and the tokens are OR-ed, which
/// approximates natural-language matching and keeps FTS5 operators in
/// user input (quotes, `NEAR`, `*`) from becoming syntax errors.
/// Returns `None` when the query has no usable tokens.
pub fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Multiplicative personalization of a base relevance score.
///
/// Factors compose in a fixed order; constants come from `[ranking]`
/// config. Only the first category match counts (no stacking).
pub fn personalize(base: f64, item: &RetrievedItem, ctx: &ActorContext, weights: &RankingConfig) -> f64 {
    let mut score = base;

    if ctx.price_range.contains(item.effective_price()) {
        score *= weights.price_fit_boost;
    }

    if item
        .categories
        .iter()
        .any(|c| ctx.preferred_categories.iter().any(|p| p.eq_ignore_ascii_case(c)))
    {
        score *= weights.category_affinity_boost;
    }

    if ctx.recently_viewed.contains(&item.item_id) {
        score *= weights.seen_penalty;
    }

    match ctx.primary_segment.as_str() {
        "bargain_hunter" if item.is_on_sale() => score *= weights.bargain_sale_boost,
        "vip_customer" if item.effective_price() > weights.premium_price_threshold => {
            score *= weights.vip_premium_boost
        }
        _ => {}
    }

    score
}

/// Rank a retrieved candidate set for an actor.
pub fn rank_candidates(
    candidates: Vec<RetrievedItem>,
    ctx: &ActorContext,
    weights: &RankingConfig,
    limit: usize,
) -> Vec<RankedProduct> {
    let mut ranked: Vec<RankedProduct> = candidates
        .into_iter()
        .map(|item| {
            let personalized_score = personalize(item.relevance_score, &item, ctx, weights);
            RankedProduct {
                item_id: item.item_id,
                title: item.title,
                price: item.price,
                sale_price: item.sale_price,
                stock_status: item.stock_status,
                categories: item.categories,
                popularity_score: item.popularity_score,
                relevance_score: item.relevance_score,
                personalized_score,
                personalized: personalized_score > item.relevance_score,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.personalized_score
            .partial_cmp(&a.personalized_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.popularity_score
                    .partial_cmp(&a.popularity_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.item_id.cmp(&b.item_id))
    });

    ranked.truncate(limit);
    ranked
}

/// Retrieve and personalize products for a query.
pub async fn search_products(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    ctx: &ActorContext,
) -> Result<Vec<RankedProduct>> {
    let Some(match_expr) = fts_match_expr(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT si.item_id, si.title, si.price, si.sale_price, si.stock_status,
               si.category_names, si.popularity_score,
               bm25(search_index_fts) AS rank
        FROM search_index_fts
        JOIN search_index si ON si.item_id = search_index_fts.item_id
        WHERE search_index_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(config.search.candidate_limit as i64)
    .fetch_all(pool)
    .await?;

    let candidates: Vec<RetrievedItem> = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            let category_names: String = row.get("category_names");
            RetrievedItem {
                item_id: row.get("item_id"),
                title: row.get("title"),
                price: row.get("price"),
                sale_price: row.get("sale_price"),
                stock_status: StockStatus::parse(row.get::<String, _>("stock_status").as_str()),
                categories: split_names(&category_names),
                popularity_score: row.get("popularity_score"),
                relevance_score: -rank, // negate so higher = better
            }
        })
        .collect();

    Ok(rank_candidates(
        candidates,
        ctx,
        &config.ranking,
        config.search.result_limit,
    ))
}

/// Split a `", "`-joined name list back into parts.
pub fn split_names(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DisabledOracle;
    use crate::profile::PriceRange;
    use crate::testutil::{sample_item, test_setup};

    fn item(id: i64, price: f64, relevance: f64) -> RetrievedItem {
        RetrievedItem {
            item_id: id,
            title: format!("Item {id}"),
            price,
            sale_price: None,
            stock_status: StockStatus::InStock,
            categories: Vec::new(),
            popularity_score: 0.0,
            relevance_score: relevance,
        }
    }

    fn ctx_with(f: impl FnOnce(&mut ActorContext)) -> ActorContext {
        let mut ctx = ActorContext::guest();
        f(&mut ctx);
        ctx
    }

    #[test]
    fn test_fts_match_expr_quotes_tokens() {
        assert_eq!(fts_match_expr("blue t-shirt"), Some("\"blue\" OR \"t\" OR \"shirt\"".into()));
        assert_eq!(fts_match_expr("NEAR(\"x\")"), Some("\"NEAR\" OR \"x\"".into()));
        assert_eq!(fts_match_expr("!!!"), None);
        assert_eq!(fts_match_expr(""), None);
    }

    #[test]
    fn test_price_fit_ranks_in_range_higher() {
        let weights = RankingConfig::default();
        let ctx = ctx_with(|c| c.price_range = PriceRange { min: 20.0, max: 60.0 });

        // Equal base relevance; only one is inside the preferred range
        let ranked = rank_candidates(
            vec![item(1, 200.0, 5.0), item(2, 40.0, 5.0)],
            &ctx,
            &weights,
            10,
        );
        assert_eq!(ranked[0].item_id, 2);
        assert!(ranked[0].personalized_score > ranked[1].personalized_score);
        assert!(ranked[0].personalized);
        assert!(!ranked[1].personalized);
    }

    #[test]
    fn test_category_affinity_single_match_no_stacking() {
        let weights = RankingConfig::default();
        let ctx = ctx_with(|c| {
            c.preferred_categories = vec!["Shoes".to_string(), "Apparel".to_string()];
            c.price_range = PriceRange { min: 1000.0, max: 2000.0 };
        });

        let mut one_match = item(1, 10.0, 2.0);
        one_match.categories = vec!["Shoes".to_string()];
        let mut two_matches = item(2, 10.0, 2.0);
        two_matches.categories = vec!["Shoes".to_string(), "Apparel".to_string()];

        let s1 = personalize(2.0, &one_match, &ctx, &weights);
        let s2 = personalize(2.0, &two_matches, &ctx, &weights);
        assert!((s1 - 2.0 * 1.3).abs() < 1e-9);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_seen_penalty_demotes_repeats() {
        let weights = RankingConfig::default();
        let ctx = ctx_with(|c| {
            c.recently_viewed = vec![1];
            c.price_range = PriceRange { min: 1000.0, max: 2000.0 };
        });

        let s = personalize(5.0, &item(1, 10.0, 5.0), &ctx, &weights);
        assert!((s - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_segment_bonuses() {
        let weights = RankingConfig::default();

        let mut on_sale = item(1, 100.0, 1.0);
        on_sale.sale_price = Some(70.0);
        let bargain = ctx_with(|c| {
            c.primary_segment = "bargain_hunter".to_string();
            c.price_range = PriceRange { min: 1000.0, max: 2000.0 };
        });
        assert!((personalize(1.0, &on_sale, &bargain, &weights) - 1.5).abs() < 1e-9);

        let premium = item(2, 150.0, 1.0);
        let vip = ctx_with(|c| {
            c.primary_segment = "vip_customer".to_string();
            c.price_range = PriceRange { min: 1000.0, max: 2000.0 };
        });
        assert!((personalize(1.0, &premium, &vip, &weights) - 1.2).abs() < 1e-9);

        // vip bonus needs the premium threshold crossed
        let cheap = item(3, 50.0, 1.0);
        assert!((personalize(1.0, &cheap, &vip, &weights) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_multipliers_compose() {
        let weights = RankingConfig::default();
        let ctx = ctx_with(|c| {
            c.primary_segment = "bargain_hunter".to_string();
            c.price_range = PriceRange { min: 0.0, max: 100.0 };
            c.preferred_categories = vec!["Shoes".to_string()];
            c.recently_viewed = vec![1];
        });

        let mut it = item(1, 80.0, 2.0);
        it.sale_price = Some(60.0);
        it.categories = vec!["Shoes".to_string()];

        let expected = 2.0 * 1.2 * 1.3 * 0.8 * 1.5;
        assert!((personalize(2.0, &it, &ctx, &weights) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_tie_break_popularity_then_id() {
        let weights = RankingConfig::default();
        let ctx = ctx_with(|c| c.price_range = PriceRange { min: 1000.0, max: 2000.0 });

        let mut a = item(9, 10.0, 3.0);
        a.popularity_score = 5.0;
        let b = item(2, 10.0, 3.0);
        let c = item(1, 10.0, 3.0);

        let ranked = rank_candidates(vec![c, a, b], &ctx, &weights, 10);
        let ids: Vec<i64> = ranked.iter().map(|r| r.item_id).collect();
        assert_eq!(ids, vec![9, 1, 2]);
    }

    #[tokio::test]
    async fn test_upsert_then_exact_title_search_roundtrip() {
        let (_tmp, config, pool) = test_setup().await;
        let item = sample_item(42, "Aurora Desk Lamp", 59.0);
        crate::index::upsert_record(&pool, &config, &DisabledOracle, &item)
            .await
            .unwrap();

        let results = search_products(&pool, &config, "Aurora Desk Lamp", &ActorContext::guest())
            .await
            .unwrap();
        assert!(results.iter().any(|r| r.item_id == 42));
    }

    #[tokio::test]
    async fn test_search_empty_index_is_empty() {
        let (_tmp, config, pool) = test_setup().await;
        let results = search_products(&pool, &config, "anything", &ActorContext::guest())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_split_names() {
        assert_eq!(split_names("Shoes, Apparel"), vec!["Shoes", "Apparel"]);
        assert!(split_names("").is_empty());
    }
}
