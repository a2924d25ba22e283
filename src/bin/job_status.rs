use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use listing_watchbot::config;
use listing_watchbot::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Show recorded scrape jobs as JSON")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show a single job by id
    #[arg(long)]
    job: Option<String>,

    /// How many recent jobs to list
    #[arg(long, default_value = "10")]
    limit: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let output = match args.job.as_deref() {
        Some(id) => {
            let job = db::scrape_job(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no scrape job with id {}", id))?;
            serde_json::to_string_pretty(&job)?
        }
        None => {
            let jobs = db::recent_scrape_jobs(&pool, args.limit).await?;
            serde_json::to_string_pretty(&jobs)?
        }
    };
    println!("{}", output);
    Ok(())
}
