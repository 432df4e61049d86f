//! Behavior event store and the asynchronous tracking write path.
//!
//! Events are append-only and trimmed to a bounded window per actor and
//! kind, so profile derivation stays cheap and recency-bounded. The HTTP
//! tracking surface never writes inline: requests are queued onto a
//! bounded channel and drained by a background writer task, keeping read
//! latency decoupled from write durability. Tracking is best-effort; a
//! full queue or failed write is logged and dropped.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{EventKind, StoredEvent};
use crate::segments::{self, SegmentDef};

/// One tracking call as received from the boundary.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub actor_id: String,
    pub action: String,
    pub data: serde_json::Value,
    pub device: Option<String>,
}

/// Append one event and trim the actor's window for that kind.
pub async fn record_event(
    pool: &SqlitePool,
    actor_id: &str,
    kind: EventKind,
    payload: &serde_json::Value,
    device: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO behavior_events (id, actor_id, kind, payload, device, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(payload.to_string())
    .bind(device)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM behavior_events
        WHERE actor_id = ? AND kind = ? AND id NOT IN (
            SELECT id FROM behavior_events
            WHERE actor_id = ? AND kind = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
        )
        "#,
    )
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(actor_id)
    .bind(kind.as_str())
    .bind(kind.window())
    .execute(pool)
    .await?;

    Ok(())
}

/// All retained events for an actor, oldest first.
pub async fn fetch_events(pool: &SqlitePool, actor_id: &str) -> Result<Vec<StoredEvent>> {
    let rows: Vec<(String, String, String, String, Option<String>, i64)> = sqlx::query_as(
        "SELECT id, actor_id, kind, payload, device, created_at \
         FROM behavior_events WHERE actor_id = ? ORDER BY created_at ASC, rowid ASC",
    )
    .bind(actor_id)
    .fetch_all(pool)
    .await?;

    let events = rows
        .into_iter()
        .filter_map(|(id, actor_id, kind, payload, device, created_at)| {
            let kind = EventKind::parse(&kind)?;
            Some(StoredEvent {
                id,
                actor_id,
                kind,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
                device,
                created_at: chrono::DateTime::from_timestamp(created_at, 0)?,
            })
        })
        .collect();

    Ok(events)
}

/// Item ids of the actor's most recent product views, newest first.
pub async fn recent_view_ids(pool: &SqlitePool, actor_id: &str, limit: i64) -> Result<Vec<i64>> {
    let payloads: Vec<String> = sqlx::query_scalar(
        "SELECT payload FROM behavior_events \
         WHERE actor_id = ? AND kind = 'view' \
         ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )
    .bind(actor_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(payloads
        .iter()
        .filter_map(|p| {
            serde_json::from_str::<serde_json::Value>(p)
                .ok()?
                .get("item_id")?
                .as_i64()
        })
        .collect())
}

/// Record a query-sequence transition for related-search mining.
///
/// The read of the previous query and the write of the new one run in one
/// transaction; SQLite serializes writers, which makes the per-actor
/// read-then-write atomic under concurrent requests from the same actor.
pub async fn record_search_transition(
    pool: &SqlitePool,
    actor_id: &str,
    query: &str,
) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let previous: Option<(String, i64)> =
        sqlx::query_as("SELECT last_query, last_seen_at FROM search_sessions WHERE actor_id = ?")
            .bind(actor_id)
            .fetch_optional(&mut *tx)
            .await?;

    if let Some((last_query, last_seen_at)) = previous {
        if last_query != query {
            sqlx::query(
                "INSERT INTO search_sequences \
                 (previous_query, next_query, gap_seconds, actor_id, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&last_query)
            .bind(query)
            .bind((now - last_seen_at).max(0))
            .bind(actor_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO search_sessions (actor_id, last_query, last_seen_at) VALUES (?, ?, ?)
        ON CONFLICT(actor_id) DO UPDATE SET
            last_query = excluded.last_query,
            last_seen_at = excluded.last_seen_at
        "#,
    )
    .bind(actor_id)
    .bind(query)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Apply one tracking request: validate the action, append the event, and
/// recompute segments on the behavior triggers that warrant it.
pub async fn apply_track_request(
    pool: &SqlitePool,
    defs: &[SegmentDef],
    req: &TrackRequest,
) -> Result<()> {
    let Some(kind) = EventKind::parse(&req.action) else {
        anyhow::bail!("unknown action type: {}", req.action);
    };

    record_event(pool, &req.actor_id, kind, &req.data, req.device.as_deref()).await?;

    if matches!(kind, EventKind::Purchase | EventKind::CartAbandon) {
        segments::compute_and_store(pool, defs, &req.actor_id).await?;
    }

    Ok(())
}

/// Spawn the background writer draining tracking requests off the channel.
///
/// Returns the sender handed to the HTTP surface. `try_send` on a full
/// channel drops the event — tracking must never block a user-facing
/// response.
pub fn spawn_event_writer(
    pool: SqlitePool,
    defs: Arc<Vec<SegmentDef>>,
    buffer: usize,
) -> mpsc::Sender<TrackRequest> {
    let (tx, mut rx) = mpsc::channel::<TrackRequest>(buffer);

    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            if let Err(e) = apply_track_request(&pool, &defs, &req).await {
                tracing::warn!(
                    target: "csx::behavior",
                    actor = %req.actor_id,
                    action = %req.action,
                    error = %e,
                    "dropping behavior event"
                );
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_setup;
    use serde_json::json;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let (tmp, _config, pool) = test_setup().await;
        (tmp, pool)
    }

    #[tokio::test]
    async fn test_record_and_fetch_events() {
        let (_tmp, pool) = test_pool().await;

        record_event(&pool, "u1", EventKind::View, &json!({"item_id": 5}), Some("mobile"))
            .await
            .unwrap();
        record_event(&pool, "u1", EventKind::Search, &json!({"query": "shoes"}), None)
            .await
            .unwrap();

        let events = fetch_events(&pool, "u1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::View);
        assert_eq!(events[0].device.as_deref(), Some("mobile"));

        assert!(fetch_events(&pool, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_window_trims_old_searches() {
        let (_tmp, pool) = test_pool().await;

        for i in 0..25 {
            record_event(&pool, "u1", EventKind::Search, &json!({"query": format!("q{i}")}), None)
                .await
                .unwrap();
        }

        let events = fetch_events(&pool, "u1").await.unwrap();
        assert_eq!(events.len() as i64, EventKind::Search.window());
    }

    #[tokio::test]
    async fn test_recent_view_ids_newest_first() {
        let (_tmp, pool) = test_pool().await;

        for id in [1i64, 2, 3] {
            record_event(&pool, "u1", EventKind::View, &json!({"item_id": id}), None)
                .await
                .unwrap();
        }

        let ids = recent_view_ids(&pool, "u1", 2).await.unwrap();
        assert_eq!(ids, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_search_transition_records_sequences() {
        let (_tmp, pool) = test_pool().await;

        record_search_transition(&pool, "u1", "shoes").await.unwrap();
        record_search_transition(&pool, "u1", "running shoes").await.unwrap();
        // Repeating the same query must not create a self-transition
        record_search_transition(&pool, "u1", "running shoes").await.unwrap();

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT previous_query, next_query FROM search_sequences")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![("shoes".to_string(), "running shoes".to_string())]);

        let last: String =
            sqlx::query_scalar("SELECT last_query FROM search_sessions WHERE actor_id = 'u1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(last, "running shoes");
    }

    #[tokio::test]
    async fn test_apply_track_request_rejects_unknown_action() {
        let (_tmp, pool) = test_pool().await;
        let req = TrackRequest {
            actor_id: "u1".to_string(),
            action: "teleport".to_string(),
            data: json!({}),
            device: None,
        };
        assert!(apply_track_request(&pool, &[], &req).await.is_err());
        assert!(fetch_events(&pool, "u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purchase_triggers_segment_recompute() {
        let (_tmp, pool) = test_pool().await;
        let defs = crate::segments::default_segments();

        let req = TrackRequest {
            actor_id: "u1".to_string(),
            action: "purchase".to_string(),
            data: json!({"order_total": 50.0, "items": []}),
            device: None,
        };
        apply_track_request(&pool, &defs, &req).await.unwrap();

        let primary: Option<String> =
            sqlx::query_scalar("SELECT primary_segment FROM actor_segments WHERE actor_id = 'u1'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(primary.is_some());
    }
}
