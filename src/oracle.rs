//! Suggestion oracle abstraction and implementations.
//!
//! Every external language-model touchpoint — spell correction, query
//! completions, category prediction, related searches, keyword generation —
//! goes through the single [`SuggestionOracle`] trait with one timeout and
//! fallback contract, instead of ad hoc HTTP calls per feature.
//!
//! Implementations:
//! - **[`DisabledOracle`]** — returns errors; used when no oracle is configured.
//! - **[`OpenAiOracle`]** — calls an OpenAI-compatible chat completions
//!   endpoint with a per-call timeout.
//!
//! # Failure contract
//!
//! Oracle answers must parse as a JSON array of strings or
//! `{text|name, confidence}` objects; anything else is treated as an empty
//! answer. Query-path call sites never retry and degrade to local-only
//! results on any error. The indexing path (keyword generation) retries
//! with exponential backoff like any other background write.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::OracleConfig;
use crate::models::CatalogItem;
use crate::profile::ActorContext;

/// A natural-language oracle that completes a system/user prompt pair.
#[async_trait]
pub trait SuggestionOracle: Send + Sync {
    /// Implementation name for logs.
    fn name(&self) -> &str;

    /// One chat completion; the returned string is the raw model content.
    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> Result<String>;
}

// ============ Disabled oracle ============

/// A no-op oracle that always errors; callers fall back to local signals.
pub struct DisabledOracle;

#[async_trait]
impl SuggestionOracle for DisabledOracle {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _user: &str, _timeout: Duration) -> Result<String> {
        bail!("suggestion oracle is disabled")
    }
}

// ============ OpenAI-compatible oracle ============

/// Oracle backed by any OpenAI-compatible chat completions endpoint.
pub struct OpenAiOracle {
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiOracle {
    /// Create the oracle from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured API key environment variable is
    /// not set. A missing key is a configuration error and fatal at
    /// startup; per-request failures never are.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        Ok(Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl SuggestionOracle for OpenAiOracle {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> Result<String> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.3,
            "max_tokens": 200,
        });

        let response = client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("oracle API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("unexpected oracle response shape"))?;

        Ok(content.to_string())
    }
}

/// Create the appropriate [`SuggestionOracle`] based on configuration.
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn SuggestionOracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledOracle)),
        "openai" => Ok(Box::new(OpenAiOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

// ============ Typed oracle calls ============

/// Ask for a corrected form of a query. Plain-text answer; the first
/// non-empty line is taken, and implausibly long answers are rejected.
pub async fn correct_spelling(
    oracle: &dyn SuggestionOracle,
    config: &OracleConfig,
    query: &str,
) -> Result<String> {
    let content = oracle
        .complete(
            "You are a spell checker for e-commerce searches. Correct spelling errors while \
             preserving the intent. Return only the corrected query, nothing else.",
            query,
            Duration::from_secs(config.suggest_timeout_secs),
        )
        .await?;

    let corrected = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if corrected.is_empty() || corrected.chars().count() > 100 {
        bail!("implausible spell correction: {:?}", corrected);
    }
    Ok(corrected.to_string())
}

/// Ask for query completions given the actor's context.
pub async fn suggest_completions(
    oracle: &dyn SuggestionOracle,
    config: &OracleConfig,
    query: &str,
    ctx: &ActorContext,
) -> Result<Vec<String>> {
    let mut context_prompt = format!("User segment: {}\n", ctx.primary_segment);
    if !ctx.preferred_categories.is_empty() {
        context_prompt.push_str(&format!(
            "Preferred categories: {}\n",
            ctx.preferred_categories.join(", ")
        ));
    }
    context_prompt.push_str(&format!(
        "Price range: ${:.0} - ${:.0}\n",
        ctx.price_range.min, ctx.price_range.max
    ));

    let content = oracle
        .complete(
            "You are an e-commerce search assistant. Given a partial search query and user \
             context, suggest relevant search completions. Return a JSON array of suggestions.",
            &format!("Query: {query}\n{context_prompt}Suggest 5 relevant search completions."),
            Duration::from_secs(config.suggest_timeout_secs),
        )
        .await?;

    Ok(parse_text_array(&content))
}

/// Ask which of the known categories a query most likely targets.
/// Returns `(name, confidence)` pairs; unknown names are filtered by the
/// caller against the real category list.
pub async fn predict_categories(
    oracle: &dyn SuggestionOracle,
    config: &OracleConfig,
    query: &str,
    available: &[String],
) -> Result<Vec<(String, f64)>> {
    let listed: Vec<&str> = available.iter().take(50).map(|s| s.as_str()).collect();

    let content = oracle
        .complete(
            "You are an e-commerce category predictor. Given a search query, predict the most \
             likely product categories from the available list. Return a JSON array of objects \
             with name and confidence fields.",
            &format!(
                "Query: {query}\nAvailable categories: {}\nPredict top 3 categories with \
                 confidence scores.",
                listed.join(", ")
            ),
            Duration::from_secs(config.suggest_timeout_secs),
        )
        .await?;

    Ok(parse_scored_array(&content))
}

/// Ask for searches related to the given one.
pub async fn related_searches(
    oracle: &dyn SuggestionOracle,
    config: &OracleConfig,
    query: &str,
) -> Result<Vec<String>> {
    let content = oracle
        .complete(
            "You are an e-commerce search assistant. Given a search query, suggest 5 related \
             searches that users might be interested in. Return only a JSON array of search \
             queries.",
            &format!("Original search: {query}"),
            Duration::from_secs(config.suggest_timeout_secs),
        )
        .await?;

    Ok(parse_text_array(&content))
}

/// Ask for additional search keywords for a product (indexing path:
/// longer timeout, retried with backoff).
pub async fn product_keywords(
    oracle: &dyn SuggestionOracle,
    config: &OracleConfig,
    item: &CatalogItem,
) -> Result<Vec<String>> {
    let body_excerpt: String = item.body_text.split_whitespace().take(50).collect::<Vec<_>>().join(" ");
    let user = format!(
        "Product: {}\nDescription: {}\nCategory: {}",
        item.title,
        body_excerpt,
        item.category_names.join(", ")
    );

    let timeout = Duration::from_secs(config.index_timeout_secs);
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match oracle
            .complete(
                "You are an SEO expert. Generate 10 relevant search keywords for the given \
                 product. Return only a JSON array of keywords.",
                &user,
                timeout,
            )
            .await
        {
            Ok(content) => return Ok(parse_text_array(&content)),
            Err(e) => {
                tracing::warn!(
                    target: "csx::oracle",
                    attempt,
                    error = %e,
                    "keyword generation attempt failed"
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("keyword generation failed")))
}

// ============ Response validation ============

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse a JSON array of strings or `{text|name: ...}` objects.
/// Malformed or differently-shaped content yields an empty list.
pub fn parse_text_array(content: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(strip_fence(content)) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(obj) => obj
                .get("text")
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a JSON array of `{text|name, confidence}` objects. Confidence is
/// clamped to `[0, 1]`; entries without a usable name are dropped.
pub fn parse_scored_array(content: &str) -> Vec<(String, f64)> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(strip_fence(content)) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = obj
                .get("name")
                .or_else(|| obj.get("text"))
                .and_then(|v| v.as_str())?
                .trim()
                .to_string();
            if name.is_empty() {
                return None;
            }
            let confidence = obj
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            Some((name, confidence))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_array_strings() {
        let parsed = parse_text_array(r#"["red shoes", "running shoes"]"#);
        assert_eq!(parsed, vec!["red shoes", "running shoes"]);
    }

    #[test]
    fn test_parse_text_array_objects() {
        let parsed = parse_text_array(r#"[{"text": "red shoes"}, {"name": "boots"}]"#);
        assert_eq!(parsed, vec!["red shoes", "boots"]);
    }

    #[test]
    fn test_parse_text_array_mixed_skips_junk() {
        let parsed = parse_text_array(r#"["ok", 42, {"other": "x"}, "", "  "]"#);
        assert_eq!(parsed, vec!["ok"]);
    }

    #[test]
    fn test_parse_text_array_malformed_is_empty() {
        assert!(parse_text_array("I think you want shoes!").is_empty());
        assert!(parse_text_array(r#"{"not": "an array"}"#).is_empty());
        assert!(parse_text_array("").is_empty());
    }

    #[test]
    fn test_parse_text_array_strips_code_fence() {
        let parsed = parse_text_array("```json\n[\"red shoes\"]\n```");
        assert_eq!(parsed, vec!["red shoes"]);
    }

    #[test]
    fn test_parse_scored_array() {
        let parsed = parse_scored_array(
            r#"[{"name": "Shoes", "confidence": 0.9}, {"name": "Socks", "confidence": 1.7}]"#,
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("Shoes".to_string(), 0.9));
        // Out-of-range confidence is clamped
        assert_eq!(parsed[1], ("Socks".to_string(), 1.0));
    }

    #[test]
    fn test_parse_scored_array_defaults_confidence() {
        let parsed = parse_scored_array(r#"[{"name": "Shoes"}]"#);
        assert_eq!(parsed, vec![("Shoes".to_string(), 0.5)]);
    }

    #[test]
    fn test_parse_scored_array_malformed_is_empty() {
        assert!(parse_scored_array("not json").is_empty());
        assert!(parse_scored_array(r#"["just", "strings"]"#).is_empty());
    }

    #[tokio::test]
    async fn test_disabled_oracle_errors() {
        let oracle = DisabledOracle;
        let result = oracle.complete("s", "u", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    /// An oracle returning a canned answer, for exercising the typed calls.
    pub struct CannedOracle(pub String);

    #[async_trait]
    impl SuggestionOracle for CannedOracle {
        fn name(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _s: &str, _u: &str, _t: Duration) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_correct_spelling_takes_first_line() {
        let oracle = CannedOracle("t-shirt\nextra commentary".to_string());
        let cfg = OracleConfig::default();
        let corrected = correct_spelling(&oracle, &cfg, "tshrit").await.unwrap();
        assert_eq!(corrected, "t-shirt");
    }

    #[tokio::test]
    async fn test_correct_spelling_rejects_rambling() {
        let oracle = CannedOracle("x".repeat(300));
        let cfg = OracleConfig::default();
        assert!(correct_spelling(&oracle, &cfg, "tshrit").await.is_err());
    }

    #[tokio::test]
    async fn test_suggest_completions_parses() {
        let oracle = CannedOracle(r#"["red shoes", "red boots"]"#.to_string());
        let cfg = OracleConfig::default();
        let ctx = ActorContext::guest();
        let got = suggest_completions(&oracle, &cfg, "red", &ctx).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn test_suggest_completions_malformed_is_empty() {
        let oracle = CannedOracle("sorry, I can't help with that".to_string());
        let cfg = OracleConfig::default();
        let ctx = ActorContext::guest();
        let got = suggest_completions(&oracle, &cfg, "red", &ctx).await.unwrap();
        assert!(got.is_empty());
    }
}
