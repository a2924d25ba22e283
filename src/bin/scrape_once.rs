use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use listing_watchbot::config;
use listing_watchbot::coordinator::Coordinator;
use listing_watchbot::db::{self, SqliteStore};
use listing_watchbot::notify::{self, OutboxNotifier};
use listing_watchbot::outbox;
use listing_watchbot::shutdown;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single scrape across all enabled sources and print the job record"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Deliver every notification that is due before exiting
    #[arg(long)]
    drain_outbox: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool.clone()));

    let notifier = Arc::new(OutboxNotifier::new(pool.clone()));
    let coordinator = Coordinator::from_config(&cfg, store, notifier)?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; stopping after current page fetches");
            trigger.trigger();
        }
    });

    let job = coordinator.run(&shutdown).await?;

    if args.drain_outbox {
        let delivery = notify::delivery_from_config(&cfg.notifications)?;
        let max_backoff = cfg.notifications.max_backoff_seconds as i64;
        let max_attempts = cfg.notifications.max_attempts as i32;
        let mut delivered = 0;
        while !shutdown.is_triggered()
            && outbox::process_next_notification(&pool, delivery.as_ref(), max_backoff, max_attempts)
                .await?
        {
            delivered += 1;
        }
        let remaining = db::count_pending_notifications(&pool).await?;
        info!(processed = delivered, remaining, "outbox drained");
    }

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
