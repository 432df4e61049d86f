//! Scheduled maintenance: index optimization and segment sweeps.
//!
//! Both jobs run on fixed intervals inside the server process. A run is
//! bounded (the sweep caps its batch, optimize touches each row once) and
//! guarded against overlap: if a tick fires while the previous run is
//! still active, the tick is skipped and logged rather than stacked.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::index;
use crate::segments::{self, SegmentDef};

/// Spawn the periodic maintenance tasks. The first tick of each job fires
/// one full interval after startup, so a restart never doubles up decay.
pub fn spawn_jobs(
    pool: SqlitePool,
    config: Arc<Config>,
    defs: Arc<Vec<SegmentDef>>,
) -> Vec<JoinHandle<()>> {
    let optimize_guard = Arc::new(Mutex::new(()));
    let sweep_guard = Arc::new(Mutex::new(()));

    let optimize_handle = {
        let pool = pool.clone();
        let config = config.clone();
        let guard = optimize_guard;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.maintenance.optimize_interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // consume the immediate tick

            loop {
                interval.tick().await;
                let Ok(_lock) = guard.try_lock() else {
                    tracing::warn!(target: "csx::maintenance", "optimize still running, skipping tick");
                    continue;
                };
                if let Err(e) = index::optimize(&pool, &config).await {
                    tracing::warn!(target: "csx::maintenance", error = %e, "index optimize failed");
                }
            }
        })
    };

    let sweep_handle = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.maintenance.sweep_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Ok(_lock) = sweep_guard.try_lock() else {
                tracing::warn!(target: "csx::maintenance", "segment sweep still running, skipping tick");
                continue;
            };
            if let Err(e) = segments::sweep(
                &pool,
                &defs,
                config.maintenance.sweep_ttl_secs,
                config.maintenance.sweep_batch,
            )
            .await
            {
                tracing::warn!(target: "csx::maintenance", error = %e, "segment sweep failed");
            }
        }
    });

    vec![optimize_handle, sweep_handle]
}
