use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use listing_watchbot::config;
use listing_watchbot::coordinator::Coordinator;
use listing_watchbot::db::{self, SqliteStore, Storage};
use listing_watchbot::notify::{self, OutboxNotifier};
use listing_watchbot::outbox;
use listing_watchbot::scheduler::Scheduler;
use listing_watchbot::shutdown;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let recovered = store.fail_stale_jobs(Utc::now()).await?;
    if recovered > 0 {
        info!(recovered, "recovered jobs left running by a previous process");
    }

    let (trigger, shutdown) = shutdown::channel();

    // Spawn outbox worker (single-threaded)
    let delivery = notify::delivery_from_config(&cfg.notifications)?;
    let worker_pool = pool.clone();
    let poll_sleep = Duration::from_millis(cfg.notifications.poll_interval_ms);
    let max_backoff = cfg.notifications.max_backoff_seconds as i64;
    let max_attempts = cfg.notifications.max_attempts as i32;
    let mut worker_shutdown = shutdown.clone();
    let outbox_worker = tokio::spawn(async move {
        while !worker_shutdown.is_triggered() {
            match outbox::process_next_notification(
                &worker_pool,
                delivery.as_ref(),
                max_backoff,
                max_attempts,
            )
            .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_sleep) => {}
                        _ = worker_shutdown.wait() => {}
                    }
                }
                Err(err) => {
                    error!(?err, "outbox worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let notifier = Arc::new(OutboxNotifier::new(pool.clone()));
    let coordinator = Coordinator::from_config(&cfg, store, notifier)?;
    info!(sources = ?coordinator.source_ids(), "sources configured");
    let scheduler = Scheduler::new(Arc::new(coordinator), cfg.scrape_interval())
        .with_run_on_start(cfg.app.run_on_start);

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received; finishing current page fetches");
        trigger.trigger();
    });

    scheduler.run(shutdown).await;
    if let Err(err) = outbox_worker.await {
        error!(?err, "outbox worker panicked");
    }
    info!("shutdown complete");
    Ok(())
}
