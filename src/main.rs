//! # commerce-search CLI (`csx`)
//!
//! The `csx` binary drives the engine: database initialization, catalog
//! loading and index maintenance, search, behavior tracking, segment
//! inspection, and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! csx --config ./config/csx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csx init` | Create the SQLite database and run schema migrations |
//! | `csx catalog load <file>` | Upsert catalog items from a JSON file |
//! | `csx catalog remove <id>` | Remove an item from catalog and index |
//! | `csx catalog rebuild` | Re-derive the whole index from the catalog |
//! | `csx optimize` | Run the index optimization pass now |
//! | `csx search "<query>"` | Run the predictive search pipeline |
//! | `csx suggest "<prefix>"` | Query completions only |
//! | `csx track <actor> <action>` | Record a behavior event |
//! | `csx segments <actor>` | Show (or recompute) an actor's segments |
//! | `csx sweep` | Run the segment batch sweep now |
//! | `csx stats` | Index, behavior, and segment statistics |
//! | `csx serve` | Start the HTTP server with scheduled maintenance |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use commerce_search::models::CatalogItem;
use commerce_search::profile::ActorContext;
use commerce_search::{
    behavior, config, db, index, migrate, oracle, query, segments, server, stats,
};

/// commerce-search CLI — a personalized predictive search and ranking
/// engine for commerce catalogs.
#[derive(Parser)]
#[command(
    name = "csx",
    about = "commerce-search — a personalized predictive search and ranking engine",
    version,
    long_about = "commerce-search keeps a full-text product index with popularity scoring, \
    derives user profiles and segments from tracked behavior, and serves personalized \
    predictive search over a CLI and an HTTP JSON API. An optional suggestion oracle \
    augments corrections, completions, and categories, and always falls back to \
    local-only behavior."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Manage the catalog mirror and the derived search index.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },

    /// Run the index optimization pass now.
    ///
    /// Removes records for unpublished items, decays every popularity
    /// score, and re-boosts items purchased in the trailing window.
    /// The same pass runs on a schedule inside `csx serve`.
    Optimize,

    /// Run the predictive search pipeline and print the composite result.
    Search {
        /// The search query string.
        query: String,

        /// Actor id for personalization. Anonymous when omitted.
        #[arg(long)]
        actor: Option<String>,

        /// Print the raw JSON response instead of the summary.
        #[arg(long)]
        json: bool,
    },

    /// Print query completions for a prefix.
    Suggest {
        /// The partial query.
        prefix: String,

        /// Actor id for personalization. Anonymous when omitted.
        #[arg(long)]
        actor: Option<String>,
    },

    /// Record one behavior event for an actor.
    ///
    /// Action is one of: view, add_to_cart, search, category_browse,
    /// purchase, cart_abandon. Purchase and cart_abandon trigger a
    /// segment recompute.
    Track {
        /// Actor id (user or session).
        actor: String,

        /// Action type.
        action: String,

        /// Type-specific payload as a JSON object.
        #[arg(long, default_value = "{}")]
        data: String,

        /// Device kind (e.g. mobile, desktop).
        #[arg(long)]
        device: Option<String>,
    },

    /// Show an actor's matched segments and primary segment.
    Segments {
        /// Actor id.
        actor: String,

        /// Recompute from the current profile instead of reading the
        /// stored assignment.
        #[arg(long)]
        recompute: bool,
    },

    /// Run the segment batch sweep now.
    ///
    /// Recomputes segments for actors whose assignment is stale, bounded
    /// per run. The same sweep runs on a schedule inside `csx serve`.
    Sweep,

    /// Print index, behavior, and segment statistics.
    Stats,

    /// Start the HTTP server with background tracking and maintenance.
    Serve,
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Upsert catalog items from a JSON file (array of items).
    Load {
        /// Path to the JSON catalog file.
        file: PathBuf,
    },

    /// Remove one item from the catalog and the index.
    Remove {
        /// The item id.
        item_id: i64,
    },

    /// Re-derive every index record from the catalog mirror.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable (--json output).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Catalog { action } => match action {
            CatalogAction::Load { file } => {
                let content = std::fs::read_to_string(&file)?;
                let items: Vec<CatalogItem> = serde_json::from_str(&content)?;
                let oracle = oracle::create_oracle(&cfg.oracle)?;
                let pool = db::connect(&cfg).await?;

                let mut upserted = 0u64;
                for item in &items {
                    index::upsert_record(&pool, &cfg, oracle.as_ref(), item).await?;
                    upserted += 1;
                }

                println!("catalog load");
                println!("  items read: {}", items.len());
                println!("  upserted: {}", upserted);
                println!("ok");
                pool.close().await;
            }
            CatalogAction::Remove { item_id } => {
                let pool = db::connect(&cfg).await?;
                index::remove_record(&pool, item_id).await?;
                println!("removed item {}", item_id);
                pool.close().await;
            }
            CatalogAction::Rebuild => {
                let oracle = oracle::create_oracle(&cfg.oracle)?;
                let pool = db::connect(&cfg).await?;
                let rebuilt = index::rebuild_all(&pool, &cfg, oracle.as_ref()).await?;
                println!("rebuilt {} index records", rebuilt);
                pool.close().await;
            }
        },
        Commands::Optimize => {
            let pool = db::connect(&cfg).await?;
            let outcome = index::optimize(&pool, &cfg).await?;
            println!("optimize");
            println!("  removed: {}", outcome.removed);
            println!("  decayed: {}", outcome.decayed);
            println!("  boosted: {}", outcome.boosted);
            println!("ok");
            pool.close().await;
        }
        Commands::Search { query, actor, json } => {
            let oracle = oracle::create_oracle(&cfg.oracle)?;
            let pool = db::connect(&cfg).await?;
            let response =
                query::process_query(&pool, &cfg, oracle.as_ref(), &query, actor.as_deref())
                    .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
            pool.close().await;
        }
        Commands::Suggest { prefix, actor } => {
            let oracle = oracle::create_oracle(&cfg.oracle)?;
            let pool = db::connect(&cfg).await?;
            let ctx = commerce_search::profile::build_actor_context(&pool, actor.as_deref())
                .await
                .unwrap_or_else(|_| ActorContext::guest());
            let suggestions =
                query::collect_suggestions(&pool, &cfg, oracle.as_ref(), &prefix, &ctx).await?;

            if suggestions.is_empty() {
                println!("No suggestions.");
            } else {
                for s in &suggestions {
                    println!("{}  ({:?})", s.text, s.kind);
                }
            }
            pool.close().await;
        }
        Commands::Track {
            actor,
            action,
            data,
            device,
        } => {
            let pool = db::connect(&cfg).await?;
            let defs = segments::resolve_segments(&cfg.segments);
            let req = behavior::TrackRequest {
                actor_id: actor,
                action,
                data: serde_json::from_str(&data)?,
                device,
            };
            behavior::apply_track_request(&pool, &defs, &req).await?;
            println!("tracked");
            pool.close().await;
        }
        Commands::Segments { actor, recompute } => {
            let pool = db::connect(&cfg).await?;
            let defs = segments::resolve_segments(&cfg.segments);

            let (matched, primary) = if recompute {
                let matched = segments::compute_and_store(&pool, &defs, &actor).await?;
                let primary = segments::primary_key(&matched);
                (matched, primary)
            } else {
                segments::load_or_compute(&pool, &defs, &actor).await?
            };

            println!("primary segment: {}", primary);
            for m in &matched {
                println!("  [{}] {} ({})", m.priority, m.key, m.name);
            }
            pool.close().await;
        }
        Commands::Sweep => {
            let pool = db::connect(&cfg).await?;
            let defs = segments::resolve_segments(&cfg.segments);
            let outcome = segments::sweep(
                &pool,
                &defs,
                cfg.maintenance.sweep_ttl_secs,
                cfg.maintenance.sweep_batch,
            )
            .await?;
            println!("sweep recomputed {} actors", outcome.recomputed);
            pool.close().await;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            let oracle: Arc<dyn oracle::SuggestionOracle> =
                Arc::from(oracle::create_oracle(&cfg.oracle)?);
            server::run_server(&cfg, oracle).await?;
        }
    }

    Ok(())
}

/// Human-readable summary of a search response.
fn print_response(response: &commerce_search::models::SearchResponse) {
    if !response.processed {
        println!("Query too short, not processed.");
        return;
    }

    if let Some(corrected) = &response.spell_correction {
        println!("did you mean: {}", corrected);
    }

    if response.products.is_empty() {
        println!("No results.");
    } else {
        for (i, p) in response.products.iter().enumerate() {
            let marker = if p.personalized { "*" } else { " " };
            println!(
                "{}.{} [{:.2}] {} — ${:.2} ({})",
                i + 1,
                marker,
                p.personalized_score,
                p.title,
                p.sale_price.unwrap_or(p.price),
                p.stock_status.as_str()
            );
            println!("    id: {}", p.item_id);
        }
    }

    if !response.suggestions.is_empty() {
        let texts: Vec<&str> = response.suggestions.iter().map(|s| s.text.as_str()).collect();
        println!("suggestions: {}", texts.join(", "));
    }

    if !response.categories.is_empty() {
        let cats: Vec<String> = response
            .categories
            .iter()
            .map(|c| format!("{} ({:.2})", c.name, c.confidence))
            .collect();
        println!("categories: {}", cats.join(", "));
    }

    if !response.related_searches.is_empty() {
        println!("related: {}", response.related_searches.join(", "));
    }

    if let Some(insights) = &response.insights {
        println!(
            "insights: intent={:?} sentiment={:?} urgency={:?}",
            insights.intent, insights.sentiment, insights.urgency
        );
    }
}
