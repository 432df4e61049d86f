//! The predictive query pipeline.
//!
//! `process_query` runs spell correction, suggestion collection, category
//! prediction, product retrieval, and related-search lookup concurrently,
//! then classifies insights and records the search. Every sub-step is
//! independently failure-tolerant: an error yields that step's empty
//! default and a warning, never a failed response. Queries shorter than
//! the configured minimum short-circuit to an unprocessed response
//! without touching the index or the oracle.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::behavior;
use crate::config::Config;
use crate::insights;
use crate::models::{
    CategoryPrediction, EventKind, RankedProduct, SearchResponse, Suggestion, SuggestionKind,
};
use crate::oracle::{self, SuggestionOracle};
use crate::profile::{self, ActorContext};
use crate::ranking;

/// Common storefront misspellings, checked before any oracle call.
const MISSPELLINGS: &[(&str, &str)] = &[
    ("tshirt", "t-shirt"),
    ("shooes", "shoes"),
    ("jeens", "jeans"),
    ("accesories", "accessories"),
    ("jwelry", "jewelry"),
];

/// Run the full pipeline for one query.
pub async fn process_query(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    raw: &str,
    actor_id: Option<&str>,
) -> Result<SearchResponse> {
    let query = raw.trim();
    if query.chars().count() < config.search.min_query_chars {
        return Ok(SearchResponse::unprocessed(query));
    }

    let ctx = match profile::build_actor_context(pool, actor_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(target: "csx::query", error = %e, "actor context failed, using guest");
            ActorContext::guest()
        }
    };

    // Steps have no mutual ordering dependency; run them together.
    let (spell, suggestions, categories, products, related) = tokio::join!(
        spell_correct(pool, config, oracle, query),
        collect_suggestions(pool, config, oracle, query, &ctx),
        predict_categories(pool, config, oracle, query, &ctx),
        ranking::search_products(pool, config, query, &ctx),
        related_searches(pool, config, oracle, query),
    );

    let spell_correction = absorb(spell, "spell correction").flatten();
    let suggestions = absorb(suggestions, "suggestions").unwrap_or_default();
    let categories = absorb(categories, "category prediction").unwrap_or_default();
    let products = absorb(products, "retrieval").unwrap_or_default();
    let related_searches = absorb(related, "related searches").unwrap_or_default();

    let insights = config
        .search
        .insights_enabled
        .then(|| insights::build_insights(query));

    // Tracking happens after retrieval (it needs the result set) and is
    // best-effort: a persistence failure never degrades the response.
    if let Err(e) = track_search(pool, config, query, actor_id, &products, &ctx).await {
        tracing::warn!(target: "csx::query", error = %e, "search tracking failed");
    }

    Ok(SearchResponse {
        query: query.to_string(),
        processed: true,
        spell_correction,
        suggestions,
        categories,
        products,
        related_searches,
        insights,
    })
}

fn absorb<T>(result: Result<T>, step: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(target: "csx::query", step, error = %e, "pipeline step failed");
            None
        }
    }
}

// ============ Spell correction ============

/// Correct a query: deterministic misspelling table first, then the
/// cached oracle answer when oracle-assisted correction is enabled.
/// Returns `None` when no correction differs from the input.
pub async fn spell_correct(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    query: &str,
) -> Result<Option<String>> {
    if let Some(corrected) = static_correction(query, &config.search.extra_misspellings) {
        return Ok(Some(corrected));
    }

    if !(config.oracle.is_enabled() && config.oracle.spell_correction) {
        return Ok(None);
    }

    let cache_key = query.to_lowercase();
    let fresh_after = Utc::now().timestamp() - config.search.spell_cache_ttl_secs;
    let cached: Option<String> = sqlx::query_scalar(
        "SELECT corrected FROM spell_cache WHERE query = ? AND cached_at > ?",
    )
    .bind(&cache_key)
    .bind(fresh_after)
    .fetch_optional(pool)
    .await?;

    if let Some(corrected) = cached {
        return Ok((corrected != query).then_some(corrected));
    }

    let corrected = oracle::correct_spelling(oracle, &config.oracle, query).await?;

    sqlx::query(
        r#"
        INSERT INTO spell_cache (query, corrected, cached_at) VALUES (?, ?, ?)
        ON CONFLICT(query) DO UPDATE SET
            corrected = excluded.corrected,
            cached_at = excluded.cached_at
        "#,
    )
    .bind(&cache_key)
    .bind(&corrected)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok((corrected != query).then_some(corrected))
}

/// O(1)-ish substring check against the static misspelling table.
pub fn static_correction(query: &str, extra: &[String]) -> Option<String> {
    let lower = query.to_lowercase();

    for (wrong, right) in MISSPELLINGS {
        if lower.contains(wrong) {
            return Some(replace_ignore_case(query, wrong, right));
        }
    }

    for pair in extra {
        if let Some((wrong, right)) = pair.split_once(':') {
            if !wrong.is_empty() && lower.contains(&wrong.to_lowercase()) {
                return Some(replace_ignore_case(query, wrong, right));
            }
        }
    }

    None
}

/// Case-insensitive substring replacement preserving the rest of the
/// input verbatim.
fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let lower_haystack = haystack.to_lowercase();
    let lower_needle = needle.to_lowercase();
    let mut result = String::with_capacity(haystack.len());
    let mut rest = 0;

    while let Some(pos) = lower_haystack[rest..].find(&lower_needle) {
        let start = rest + pos;
        result.push_str(&haystack[rest..start]);
        result.push_str(replacement);
        rest = start + needle.len();
    }
    result.push_str(&haystack[rest..]);
    result
}

// ============ Suggestions ============

/// Union of popular prior queries (prefix match, by frequency), index
/// titles (substring match, by popularity), and oracle completions.
/// Case-insensitively deduplicated, first source wins, capped.
pub async fn collect_suggestions(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    query: &str,
    ctx: &ActorContext,
) -> Result<Vec<Suggestion>> {
    let mut suggestions: Vec<Suggestion> = Vec::new();

    let prefix = format!("{}%", escape_like(query));
    let popular: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT query, COUNT(*) as count FROM search_log
        WHERE query LIKE ? ESCAPE '\' AND query != ?
        GROUP BY query
        ORDER BY count DESC, query ASC
        LIMIT 5
        "#,
    )
    .bind(&prefix)
    .bind(query)
    .fetch_all(pool)
    .await?;

    for (text, count) in popular {
        suggestions.push(Suggestion {
            text,
            kind: SuggestionKind::Popular,
            weight: count as f64,
        });
    }

    let needle = format!("%{}%", escape_like(query));
    let titles: Vec<(String, f64)> = sqlx::query_as(
        r#"
        SELECT DISTINCT title, popularity_score FROM search_index
        WHERE title LIKE ? ESCAPE '\'
        ORDER BY popularity_score DESC, title ASC
        LIMIT 5
        "#,
    )
    .bind(&needle)
    .fetch_all(pool)
    .await?;

    for (text, popularity) in titles {
        suggestions.push(Suggestion {
            text,
            kind: SuggestionKind::Product,
            weight: popularity,
        });
    }

    if config.oracle.is_enabled() && config.oracle.suggestions {
        match oracle::suggest_completions(oracle, &config.oracle, query, ctx).await {
            Ok(completions) => {
                for text in completions {
                    suggestions.push(Suggestion {
                        text,
                        kind: SuggestionKind::Oracle,
                        weight: 0.9,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(target: "csx::query", error = %e, "oracle suggestions unavailable");
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    suggestions.retain(|s| seen.insert(s.text.to_lowercase()));
    suggestions.truncate(config.search.suggestion_limit);

    Ok(suggestions)
}

/// Escape SQLite LIKE wildcards in user input (`\` as escape char).
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ============ Category prediction ============

#[derive(Debug, Clone)]
struct KnownCategory {
    id: i64,
    name: String,
    slug: String,
    item_count: i64,
}

/// Categories currently present in the index, with item counts.
async fn known_categories(pool: &SqlitePool) -> Result<Vec<KnownCategory>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT category_ids, category_names FROM search_index")
            .fetch_all(pool)
            .await?;

    let mut by_id: std::collections::BTreeMap<i64, KnownCategory> = std::collections::BTreeMap::new();
    for (ids, names) in &rows {
        let ids: Vec<&str> = ids.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        let names = ranking::split_names(names);
        // Parallel lists by construction; zip drops any ragged tail.
        for (id, name) in ids.iter().zip(names.iter()) {
            let Ok(id) = id.parse::<i64>() else { continue };
            by_id
                .entry(id)
                .or_insert_with(|| KnownCategory {
                    id,
                    name: name.clone(),
                    slug: slugify(name),
                    item_count: 0,
                })
                .item_count += 1;
        }
    }

    Ok(by_id.into_values().collect())
}

pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Additive confidence for a category match, clamped to 1.0.
fn category_confidence(
    config: &Config,
    query: &str,
    category: &KnownCategory,
    ctx: &ActorContext,
) -> f64 {
    let p = &config.prediction;
    let mut confidence = p.base_confidence;

    if category.name.to_lowercase().starts_with(&query.to_lowercase()) {
        confidence += p.prefix_bonus;
    }
    if ctx
        .preferred_categories
        .iter()
        .any(|c| c.eq_ignore_ascii_case(&category.name))
    {
        confidence += p.preferred_category_bonus;
    }
    if category.item_count > p.popular_category_threshold {
        confidence += p.popularity_bonus;
    }

    confidence.min(1.0)
}

/// Predict which categories a query targets: local substring matches
/// scored additively, merged with oracle predictions (higher confidence
/// wins per category), sorted by confidence.
pub async fn predict_categories(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    query: &str,
    ctx: &ActorContext,
) -> Result<Vec<CategoryPrediction>> {
    let known = known_categories(pool).await?;
    let lower = query.to_lowercase();
    let query_slug = slugify(query);

    let mut predictions: Vec<CategoryPrediction> = known
        .iter()
        .filter(|c| {
            c.name.to_lowercase().contains(&lower)
                || (!query_slug.is_empty() && c.slug.contains(&query_slug))
        })
        .map(|c| CategoryPrediction {
            id: c.id,
            name: c.name.clone(),
            slug: c.slug.clone(),
            item_count: c.item_count,
            confidence: category_confidence(config, query, c, ctx),
        })
        .collect();

    if config.oracle.is_enabled() && config.oracle.category_prediction {
        let names: Vec<String> = known.iter().map(|c| c.name.clone()).collect();
        match oracle::predict_categories(oracle, &config.oracle, query, &names).await {
            Ok(predicted) => {
                for (name, confidence) in predicted {
                    // Only categories the index actually knows survive the merge.
                    let Some(cat) = known.iter().find(|c| c.name.eq_ignore_ascii_case(&name))
                    else {
                        continue;
                    };
                    match predictions.iter_mut().find(|p| p.id == cat.id) {
                        Some(existing) => {
                            existing.confidence = existing.confidence.max(confidence)
                        }
                        None => predictions.push(CategoryPrediction {
                            id: cat.id,
                            name: cat.name.clone(),
                            slug: cat.slug.clone(),
                            item_count: cat.item_count,
                            confidence,
                        }),
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target: "csx::query", error = %e, "oracle categories unavailable");
            }
        }
    }

    predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.item_count.cmp(&a.item_count))
            .then(a.id.cmp(&b.id))
    });
    predictions.truncate(config.search.category_limit);

    Ok(predictions)
}

// ============ Related searches ============

/// Queries that historically followed this one, topped up by the oracle
/// when local mining is thin.
pub async fn related_searches(
    pool: &SqlitePool,
    config: &Config,
    oracle: &dyn SuggestionOracle,
    query: &str,
) -> Result<Vec<String>> {
    let mut related: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT next_query FROM search_sequences
        WHERE previous_query = ?
        GROUP BY next_query
        ORDER BY COUNT(*) DESC, next_query ASC
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(config.search.related_limit as i64)
    .fetch_all(pool)
    .await?;

    if related.len() < config.search.related_min_local
        && config.oracle.is_enabled()
        && config.oracle.related_searches
    {
        match oracle::related_searches(oracle, &config.oracle, query).await {
            Ok(extra) => related.extend(extra),
            Err(e) => {
                tracing::warn!(target: "csx::query", error = %e, "oracle related searches unavailable");
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    seen.insert(query.to_lowercase());
    related.retain(|r| seen.insert(r.to_lowercase()));
    related.truncate(config.search.related_limit);

    Ok(related)
}

// ============ Tracking ============

/// Persist the search: behavior event and session transition for known
/// actors, the query log for everyone, and the implicit popularity boost
/// for every returned item.
async fn track_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    actor_id: Option<&str>,
    products: &[RankedProduct],
    ctx: &ActorContext,
) -> Result<()> {
    if let Some(actor) = actor_id {
        behavior::record_event(
            pool,
            actor,
            EventKind::Search,
            &serde_json::json!({ "query": query }),
            None,
        )
        .await?;
        behavior::record_search_transition(pool, actor, query).await?;
    }

    sqlx::query(
        "INSERT INTO search_log (query, actor_id, result_count, segment, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(query)
    .bind(actor_id)
    .bind(products.len() as i64)
    .bind(&ctx.primary_segment)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    if !products.is_empty() && config.search.search_hit_boost > 0.0 {
        let placeholders = vec!["?"; products.len()].join(",");
        let sql = format!(
            "UPDATE search_index SET popularity_score = popularity_score + ? \
             WHERE item_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql).bind(config.search.search_hit_boost);
        for p in products {
            q = q.bind(p.item_id);
        }
        q.execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DisabledOracle;
    use crate::testutil::{sample_item, test_setup};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Oracle double that counts calls and returns a canned answer.
    struct CountingOracle {
        calls: AtomicUsize,
        answer: String,
    }

    impl CountingOracle {
        fn new(answer: &str) -> Self {
            CountingOracle {
                calls: AtomicUsize::new(0),
                answer: answer.to_string(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SuggestionOracle for CountingOracle {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, _s: &str, _u: &str, _t: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    #[test]
    fn test_static_correction_table() {
        assert_eq!(static_correction("tshirt", &[]), Some("t-shirt".to_string()));
        assert_eq!(static_correction("red TSHIRT sale", &[]), Some("red t-shirt sale".to_string()));
        assert_eq!(static_correction("shoes", &[]), None);
    }

    #[test]
    fn test_static_correction_extras() {
        let extra = vec!["hoody:hoodie".to_string()];
        assert_eq!(static_correction("black hoody", &extra), Some("black hoodie".to_string()));
    }

    #[test]
    fn test_replace_ignore_case_all_occurrences() {
        assert_eq!(replace_ignore_case("Tshirt and TSHIRT", "tshirt", "t-shirt"), "t-shirt and t-shirt");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Home & Garden"), "home-garden");
        assert_eq!(slugify("Shoes"), "shoes");
    }

    #[tokio::test]
    async fn test_short_query_short_circuits() {
        let (_tmp, config, pool) = test_setup().await;
        let oracle = CountingOracle::new("[]");

        let response = process_query(&pool, &config, &oracle, "a", Some("u1")).await.unwrap();
        assert!(!response.processed);
        assert!(response.suggestions.is_empty());
        assert!(response.products.is_empty());
        assert_eq!(oracle.calls(), 0);

        let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(logged, 0);
    }

    #[tokio::test]
    async fn test_static_misspelling_skips_oracle() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();
        let oracle = CountingOracle::new("should never be used");

        let corrected = spell_correct(&pool, &config, &oracle, "tshirt").await.unwrap();
        assert_eq!(corrected, Some("t-shirt".to_string()));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_spell_correction_is_cached() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();
        let oracle = CountingOracle::new("sneakers");

        let first = spell_correct(&pool, &config, &oracle, "sneekers").await.unwrap();
        let second = spell_correct(&pool, &config, &oracle, "sneekers").await.unwrap();
        assert_eq!(first, Some("sneakers".to_string()));
        assert_eq!(second, Some("sneakers".to_string()));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_suggestions_merge_dedup_and_cap() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();
        config.oracle.keyword_generation = false;

        for _ in 0..3 {
            sqlx::query(
                "INSERT INTO search_log (query, result_count, created_at) VALUES ('red shoes', 1, 0)",
            )
            .execute(&pool)
            .await
            .unwrap();
        }
        crate::index::upsert_record(&pool, &config, &DisabledOracle, &sample_item(1, "Red Boots", 30.0))
            .await
            .unwrap();

        // Oracle repeats an existing suggestion (different case) and adds one
        let oracle = CountingOracle::new(r#"["RED SHOES", "red running shoes"]"#);
        let got = collect_suggestions(&pool, &config, &oracle, "red", &ActorContext::guest())
            .await
            .unwrap();

        let texts: Vec<&str> = got.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["red shoes", "Red Boots", "red running shoes"]);
        assert_eq!(got[0].kind, SuggestionKind::Popular);
        assert_eq!(got[1].kind, SuggestionKind::Product);
        assert_eq!(got[2].kind, SuggestionKind::Oracle);
    }

    #[tokio::test]
    async fn test_malformed_oracle_payload_falls_back_to_local() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();

        sqlx::query(
            "INSERT INTO search_log (query, result_count, created_at) VALUES ('red shoes', 1, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let oracle = CountingOracle::new("I'm sorry, here are thoughts in prose");
        let got = collect_suggestions(&pool, &config, &oracle, "red", &ActorContext::guest())
            .await
            .unwrap();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "red shoes");
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_predict_categories_confidence_and_merge() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();
        config.oracle.keyword_generation = false;

        let mut item = sample_item(1, "Trail Runner", 90.0);
        item.category_ids = vec![11, 12];
        item.category_names = vec!["Shoes".to_string(), "Outdoor".to_string()];
        crate::index::upsert_record(&pool, &config, &DisabledOracle, &item).await.unwrap();

        let mut ctx = ActorContext::guest();
        ctx.preferred_categories = vec!["Shoes".to_string()];

        // Oracle is confident about Outdoor and invents an unknown category
        let oracle = CountingOracle::new(
            r#"[{"name": "Outdoor", "confidence": 0.95}, {"name": "Spaceships", "confidence": 0.99}]"#,
        );
        let got = predict_categories(&pool, &config, &oracle, "shoe", &ctx).await.unwrap();

        assert_eq!(got.len(), 2);
        // Local match: base 0.5 + prefix 0.3 + preferred 0.2, clamped to 1.0
        assert_eq!(got[0].name, "Shoes");
        assert!((got[0].confidence - 1.0).abs() < 1e-9);
        // Oracle-only prediction merged in; the invented category is dropped
        assert_eq!(got[1].name, "Outdoor");
        assert!((got[1].confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_related_searches_local_then_oracle_topup() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();

        sqlx::query(
            "INSERT INTO search_sequences (previous_query, next_query, created_at) \
             VALUES ('shoes', 'running shoes', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let oracle = CountingOracle::new(r#"["trail shoes", "running shoes", "shoes"]"#);
        let got = related_searches(&pool, &config, &oracle, "shoes").await.unwrap();

        // Local first, oracle top-up deduplicated, the query itself excluded
        assert_eq!(got, vec!["running shoes", "trail shoes"]);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_related_searches_skips_oracle_when_local_is_enough() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.oracle.provider = "openai".to_string();
        config.search.related_min_local = 1;

        sqlx::query(
            "INSERT INTO search_sequences (previous_query, next_query, created_at) \
             VALUES ('shoes', 'running shoes', 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let oracle = CountingOracle::new(r#"["never used"]"#);
        let got = related_searches(&pool, &config, &oracle, "shoes").await.unwrap();
        assert_eq!(got, vec!["running shoes"]);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_process_query_tracks_and_boosts() {
        let (_tmp, config, pool) = test_setup().await;
        crate::index::upsert_record(&pool, &config, &DisabledOracle, &sample_item(1, "Blue Kettle", 40.0))
            .await
            .unwrap();

        let response = process_query(&pool, &config, &DisabledOracle, "blue kettle", Some("u1"))
            .await
            .unwrap();
        assert!(response.processed);
        assert_eq!(response.products.len(), 1);
        assert!(response.insights.is_some());

        let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(logged, 1);

        // The returned item got the +1 relevance-feedback boost
        let score: f64 =
            sqlx::query_scalar("SELECT popularity_score FROM search_index WHERE item_id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!((score - config.search.search_hit_boost).abs() < 1e-9);

        // And the session now remembers the query for sequence mining
        let last: String =
            sqlx::query_scalar("SELECT last_query FROM search_sessions WHERE actor_id = 'u1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(last, "blue kettle");
    }

    #[tokio::test]
    async fn test_process_query_guest_logs_without_events() {
        let (_tmp, config, pool) = test_setup().await;

        let response = process_query(&pool, &config, &DisabledOracle, "kettle", None).await.unwrap();
        assert!(response.processed);

        let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(logged, 1);
        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM behavior_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(events, 0);
    }

    #[tokio::test]
    async fn test_insights_flag_disables_classification() {
        let (_tmp, mut config, pool) = test_setup().await;
        config.search.insights_enabled = false;

        let response = process_query(&pool, &config, &DisabledOracle, "buy kettle", None)
            .await
            .unwrap();
        assert!(response.insights.is_none());
    }
}
