use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    pub server: ServerConfig,
    /// Optional segment definitions. When empty, the built-in set from
    /// `segments::default_segments` is used.
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Knobs for the query-processing pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Queries shorter than this are not processed (fail-soft).
    #[serde(default = "default_min_query_chars")]
    pub min_query_chars: usize,
    #[serde(default = "default_suggestion_limit")]
    pub suggestion_limit: usize,
    #[serde(default = "default_category_limit")]
    pub category_limit: usize,
    #[serde(default = "default_related_limit")]
    pub related_limit: usize,
    /// Below this many locally-mined related searches the oracle tops up.
    #[serde(default = "default_related_min_local")]
    pub related_min_local: usize,
    /// Final product result cap.
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    /// Full-text candidate pool fetched before personalization.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Popularity added to every returned item as relevance feedback.
    #[serde(default = "default_search_hit_boost")]
    pub search_hit_boost: f64,
    #[serde(default = "default_true")]
    pub insights_enabled: bool,
    /// TTL for cached oracle spell corrections.
    #[serde(default = "default_spell_cache_ttl_secs")]
    pub spell_cache_ttl_secs: i64,
    /// Extra misspelling fixes on top of the built-in table,
    /// as `["wrong:right", ...]`.
    #[serde(default)]
    pub extra_misspellings: Vec<String>,
}

fn default_min_query_chars() -> usize {
    2
}
fn default_suggestion_limit() -> usize {
    10
}
fn default_category_limit() -> usize {
    5
}
fn default_related_limit() -> usize {
    5
}
fn default_related_min_local() -> usize {
    3
}
fn default_result_limit() -> usize {
    10
}
fn default_candidate_limit() -> usize {
    20
}
fn default_search_hit_boost() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_spell_cache_ttl_secs() -> i64 {
    3600
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            min_query_chars: default_min_query_chars(),
            suggestion_limit: default_suggestion_limit(),
            category_limit: default_category_limit(),
            related_limit: default_related_limit(),
            related_min_local: default_related_min_local(),
            result_limit: default_result_limit(),
            candidate_limit: default_candidate_limit(),
            search_hit_boost: default_search_hit_boost(),
            insights_enabled: true,
            spell_cache_ttl_secs: default_spell_cache_ttl_secs(),
            extra_misspellings: Vec::new(),
        }
    }
}

/// Additive confidence bonuses for category prediction.
///
/// Empirical tuning values carried over from production; configurable,
/// not invariants.
#[derive(Debug, Deserialize, Clone)]
pub struct PredictionConfig {
    #[serde(default = "default_base_confidence")]
    pub base_confidence: f64,
    #[serde(default = "default_prefix_bonus")]
    pub prefix_bonus: f64,
    #[serde(default = "default_preferred_category_bonus")]
    pub preferred_category_bonus: f64,
    #[serde(default = "default_popularity_bonus")]
    pub popularity_bonus: f64,
    /// Item count above which a category earns the popularity bonus.
    #[serde(default = "default_popular_category_threshold")]
    pub popular_category_threshold: i64,
}

fn default_base_confidence() -> f64 {
    0.5
}
fn default_prefix_bonus() -> f64 {
    0.3
}
fn default_preferred_category_bonus() -> f64 {
    0.2
}
fn default_popularity_bonus() -> f64 {
    0.1
}
fn default_popular_category_threshold() -> i64 {
    50
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            base_confidence: default_base_confidence(),
            prefix_bonus: default_prefix_bonus(),
            preferred_category_bonus: default_preferred_category_bonus(),
            popularity_bonus: default_popularity_bonus(),
            popular_category_threshold: default_popular_category_threshold(),
        }
    }
}

/// Multiplicative personalization factors applied to the base relevance.
#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    /// Item price inside the actor's preferred range.
    #[serde(default = "default_price_fit_boost")]
    pub price_fit_boost: f64,
    /// Item shares a category with the actor's preferred list.
    #[serde(default = "default_category_affinity_boost")]
    pub category_affinity_boost: f64,
    /// Item was recently viewed by this actor (deprioritize repeats).
    #[serde(default = "default_seen_penalty")]
    pub seen_penalty: f64,
    /// bargain_hunter segment, item on sale.
    #[serde(default = "default_bargain_sale_boost")]
    pub bargain_sale_boost: f64,
    /// vip_customer segment, item above the premium threshold.
    #[serde(default = "default_vip_premium_boost")]
    pub vip_premium_boost: f64,
    #[serde(default = "default_premium_price_threshold")]
    pub premium_price_threshold: f64,
}

fn default_price_fit_boost() -> f64 {
    1.2
}
fn default_category_affinity_boost() -> f64 {
    1.3
}
fn default_seen_penalty() -> f64 {
    0.8
}
fn default_bargain_sale_boost() -> f64 {
    1.5
}
fn default_vip_premium_boost() -> f64 {
    1.2
}
fn default_premium_price_threshold() -> f64 {
    100.0
}

impl Default for RankingConfig {
    fn default() -> Self {
        RankingConfig {
            price_fit_boost: default_price_fit_boost(),
            category_affinity_boost: default_category_affinity_boost(),
            seen_penalty: default_seen_penalty(),
            bargain_sale_boost: default_bargain_sale_boost(),
            vip_premium_boost: default_vip_premium_boost(),
            premium_price_threshold: default_premium_price_threshold(),
        }
    }
}

/// Scheduled maintenance knobs: index optimization and segment sweeps.
#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    /// Multiplicative popularity decay applied by each optimize run.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Popularity added per purchased line in the trailing window.
    #[serde(default = "default_sale_boost")]
    pub sale_boost: f64,
    #[serde(default = "default_sale_window_days")]
    pub sale_window_days: i64,
    #[serde(default = "default_optimize_interval_secs")]
    pub optimize_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Segment assignments older than this are recomputed by the sweep.
    #[serde(default = "default_sweep_ttl_secs")]
    pub sweep_ttl_secs: i64,
    /// Actors recomputed per sweep run, to cap load.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: i64,
}

fn default_decay_factor() -> f64 {
    0.95
}
fn default_sale_boost() -> f64 {
    50.0
}
fn default_sale_window_days() -> i64 {
    7
}
fn default_optimize_interval_secs() -> u64 {
    86_400
}
fn default_sweep_interval_secs() -> u64 {
    3_600
}
fn default_sweep_ttl_secs() -> i64 {
    86_400
}
fn default_sweep_batch() -> i64 {
    50
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            decay_factor: default_decay_factor(),
            sale_boost: default_sale_boost(),
            sale_window_days: default_sale_window_days(),
            optimize_interval_secs: default_optimize_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_ttl_secs: default_sweep_ttl_secs(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

/// Suggestion oracle connection and per-feature toggles.
///
/// The toggles only take effect when `provider` is not `disabled`; every
/// oracle call site degrades to local-only behavior on error or timeout.
#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default = "default_oracle_url")]
    pub url: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Timeout for query-path calls (suggestions, spell correction).
    #[serde(default = "default_suggest_timeout_secs")]
    pub suggest_timeout_secs: u64,
    /// Timeout for indexing-path calls (keyword generation).
    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,
    /// Retries for indexing-path calls; query-path calls never retry.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub spell_correction: bool,
    #[serde(default = "default_true")]
    pub suggestions: bool,
    #[serde(default = "default_true")]
    pub category_prediction: bool,
    #[serde(default = "default_true")]
    pub related_searches: bool,
    #[serde(default = "default_true")]
    pub keyword_generation: bool,
}

fn default_oracle_provider() -> String {
    "disabled".to_string()
}
fn default_oracle_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_suggest_timeout_secs() -> u64 {
    5
}
fn default_index_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    1
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleConfig {
            provider: default_oracle_provider(),
            url: default_oracle_url(),
            model: default_oracle_model(),
            api_key_env: default_api_key_env(),
            suggest_timeout_secs: default_suggest_timeout_secs(),
            index_timeout_secs: default_index_timeout_secs(),
            max_retries: default_max_retries(),
            spell_correction: true,
            suggestions: true,
            category_prediction: true,
            related_searches: true,
            keyword_generation: true,
        }
    }
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// A data-driven segment definition from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentConfig {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub priority: i64,
    #[serde(default)]
    pub rules: Vec<SegmentRuleConfig>,
}

/// One `field <op> threshold` rule.
#[derive(Debug, Deserialize, Clone)]
pub struct SegmentRuleConfig {
    pub field: String,
    /// One of `=`, `>`, `<`, `>=`, `<=`.
    pub op: String,
    pub threshold: f64,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.search.min_query_chars < 1 {
        anyhow::bail!("search.min_query_chars must be >= 1");
    }
    if config.search.result_limit < 1 {
        anyhow::bail!("search.result_limit must be >= 1");
    }
    if config.search.candidate_limit < config.search.result_limit {
        anyhow::bail!("search.candidate_limit must be >= search.result_limit");
    }
    if config.search.search_hit_boost < 0.0 {
        anyhow::bail!("search.search_hit_boost must be >= 0");
    }

    let p = &config.prediction;
    for (name, v) in [
        ("prediction.base_confidence", p.base_confidence),
        ("prediction.prefix_bonus", p.prefix_bonus),
        (
            "prediction.preferred_category_bonus",
            p.preferred_category_bonus,
        ),
        ("prediction.popularity_bonus", p.popularity_bonus),
    ] {
        if !(0.0..=1.0).contains(&v) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    let r = &config.ranking;
    for (name, v) in [
        ("ranking.price_fit_boost", r.price_fit_boost),
        ("ranking.category_affinity_boost", r.category_affinity_boost),
        ("ranking.seen_penalty", r.seen_penalty),
        ("ranking.bargain_sale_boost", r.bargain_sale_boost),
        ("ranking.vip_premium_boost", r.vip_premium_boost),
    ] {
        if v <= 0.0 {
            anyhow::bail!("{} must be > 0", name);
        }
    }

    if !(0.0..=1.0).contains(&config.maintenance.decay_factor)
        || config.maintenance.decay_factor == 0.0
    {
        anyhow::bail!("maintenance.decay_factor must be in (0.0, 1.0]");
    }
    if config.maintenance.sale_boost < 0.0 {
        anyhow::bail!("maintenance.sale_boost must be >= 0");
    }
    if config.maintenance.sweep_batch < 1 {
        anyhow::bail!("maintenance.sweep_batch must be >= 1");
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    for m in &config.search.extra_misspellings {
        if !m.contains(':') {
            anyhow::bail!("search.extra_misspellings entries must be 'wrong:right', got '{}'", m);
        }
    }

    for seg in &config.segments {
        for rule in &seg.rules {
            match rule.op.as_str() {
                "=" | ">" | "<" | ">=" | "<=" => {}
                other => anyhow::bail!(
                    "segment '{}': unknown rule operator '{}'",
                    seg.key,
                    other
                ),
            }
        }
    }

    Ok(config)
}
