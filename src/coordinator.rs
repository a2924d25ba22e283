//! One scrape run across every configured source.
//!
//! Each source gets its own worker task (bounded by a semaphore) that paces,
//! fetches and normalizes pages sequentially. Workers push normalized records
//! through a bounded channel into a single reconciliation stage, which owns
//! all store writes and alert evaluation for the run.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerts::AlertMatcher;
use crate::config::Config;
use crate::db::{Storage, StoreError};
use crate::model::{ListingRecord, ScrapeJob, ScrapeJobSiteResult};
use crate::normalize::normalize;
use crate::notify::Notifier;
use crate::ratelimit::{FetchOutcome, Pacer};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::shutdown::Shutdown;
use crate::sources::{self, ListingPage, SourceAdapter, SourceError, SourceSlot};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to record scrape job: {0}")]
    JobRecord(#[from] StoreError),
}

/// Records normalized from one fetched page.
#[derive(Debug)]
struct PageBatch {
    source_id: String,
    records: Vec<ListingRecord>,
}

enum FetchFailure {
    Cancelled,
    Source(SourceError),
}

pub struct Coordinator {
    sources: Vec<SourceSlot>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
    max_concurrent_sources: usize,
    channel_capacity: usize,
}

impl Coordinator {
    pub fn new(
        sources: Vec<SourceSlot>,
        store: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sources,
            reconciler: Arc::new(Reconciler::new(store)),
            notifier,
            max_concurrent_sources: 4,
            channel_capacity: 64,
        }
    }

    pub fn from_config(
        cfg: &Config,
        store: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let sources = sources::from_config(cfg)?;
        Ok(Self::new(sources, store, notifier)
            .with_limits(cfg.app.max_concurrent_sources, cfg.app.channel_capacity))
    }

    pub fn with_limits(mut self, max_concurrent_sources: usize, channel_capacity: usize) -> Self {
        self.max_concurrent_sources = max_concurrent_sources.max(1);
        self.channel_capacity = channel_capacity.max(1);
        self
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| s.adapter.source_id().to_string())
            .collect()
    }

    /// Execute one run. Only failing to persist the job record itself is an
    /// error; everything else ends up in the per-source counters.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<ScrapeJob, RunError> {
        let store = self.reconciler.store().clone();
        let mut job = ScrapeJob::start(Utc::now());
        store.record_scrape_job(&job).await?;
        info!(job_id = %job.job_id, sources = self.sources.len(), "scrape run started");

        let matcher = match store.list_active_alert_criteria().await {
            Ok(criteria) => AlertMatcher::new(criteria),
            Err(err) => {
                error!(?err, job_id = %job.job_id, "failed to load alert criteria; alerts disabled for this run");
                AlertMatcher::default()
            }
        };

        let (tx, mut rx) = mpsc::channel::<PageBatch>(self.channel_capacity);
        let permits = Arc::new(Semaphore::new(self.max_concurrent_sources));
        let mut aborts: HashMap<String, Arc<AtomicBool>> = HashMap::new();
        let mut workers: Vec<(String, JoinHandle<ScrapeJobSiteResult>)> = Vec::new();

        for slot in &self.sources {
            let source_id = slot.adapter.source_id().to_string();
            let abort = Arc::new(AtomicBool::new(false));
            aborts.insert(source_id.clone(), abort.clone());
            let handle = tokio::spawn(run_source(
                slot.clone(),
                tx.clone(),
                permits.clone(),
                shutdown.clone(),
                abort,
            ));
            workers.push((source_id, handle));
        }
        drop(tx);

        let mut stored: BTreeMap<String, ScrapeJobSiteResult> = BTreeMap::new();
        while let Some(batch) = rx.recv().await {
            let tally = stored.entry(batch.source_id.clone()).or_default();
            let abort = aborts.get(&batch.source_id);
            if abort.is_some_and(|a| a.load(Ordering::SeqCst)) {
                continue;
            }
            for record in batch.records {
                match self.reconciler.reconcile(record).await {
                    Ok(reconciled) => {
                        match reconciled.outcome {
                            Reconciliation::Inserted => tally.listings_new += 1,
                            Reconciliation::Updated { .. } => tally.listings_updated += 1,
                            Reconciliation::Unchanged => tally.listings_unchanged += 1,
                        }
                        for criteria in matcher.evaluate(&reconciled.record, reconciled.outcome) {
                            match self.notifier.notify(criteria, &reconciled.record).await {
                                Ok(()) => tally.alerts_emitted += 1,
                                Err(err) => warn!(
                                    ?err,
                                    alert_id = criteria.id,
                                    listing = %reconciled.record.key(),
                                    "notifier failed"
                                ),
                            }
                        }
                    }
                    Err(err) => {
                        error!(?err, source = %batch.source_id, "persistence failed; stopping source");
                        tally.persistence_errors += 1;
                        tally.last_error = Some(err.to_string());
                        if let Some(abort) = abort {
                            abort.store(true, Ordering::SeqCst);
                        }
                        break;
                    }
                }
            }
        }

        for (source_id, handle) in workers {
            let mut site = match handle.await {
                Ok(fetched) => fetched,
                Err(err) => {
                    error!(?err, source = %source_id, "source worker panicked");
                    ScrapeJobSiteResult {
                        fetch_errors: 1,
                        last_error: Some(err.to_string()),
                        ..Default::default()
                    }
                }
            };
            if let Some(written) = stored.remove(&source_id) {
                site.listings_new = written.listings_new;
                site.listings_updated = written.listings_updated;
                site.listings_unchanged = written.listings_unchanged;
                site.alerts_emitted = written.alerts_emitted;
                site.persistence_errors = written.persistence_errors;
                if written.last_error.is_some() {
                    site.last_error = written.last_error;
                }
            }
            site.finalize();
            info!(
                source = %source_id,
                status = ?site.status,
                pages = site.pages_fetched,
                found = site.listings_found,
                new = site.listings_new,
                updated = site.listings_updated,
                errors = site.errors,
                "source finished"
            );
            job.sites.insert(source_id, site);
        }

        job.finish(Utc::now());
        store.record_scrape_job(&job).await?;
        info!(job_id = %job.job_id, status = job.status.as_str(), "scrape run finished");
        Ok(job)
    }
}

/// Fetch-side work for one source. Returns the fetch/parse counters; the
/// reconciliation stage fills in the rest.
async fn run_source(
    slot: SourceSlot,
    tx: mpsc::Sender<PageBatch>,
    permits: Arc<Semaphore>,
    mut shutdown: Shutdown,
    abort: Arc<AtomicBool>,
) -> ScrapeJobSiteResult {
    let mut tally = ScrapeJobSiteResult::default();
    let adapter = slot.adapter.clone();
    let source_id = adapter.source_id().to_string();

    let _permit = tokio::select! {
        permit = permits.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return tally,
        },
        _ = shutdown.wait() => {
            tally.cancelled = true;
            return tally;
        }
    };

    let mut pacer = Pacer::new(source_id.clone(), slot.politeness);
    for page in 1..=adapter.max_pages() {
        if shutdown.is_triggered() {
            info!(source = %source_id, page, "shutdown requested; stopping source");
            tally.cancelled = true;
            break;
        }
        if abort.load(Ordering::SeqCst) {
            break;
        }

        let listing_page = match fetch_with_retry(adapter.as_ref(), &mut pacer, page, &mut shutdown).await {
            Ok(p) => p,
            Err(FetchFailure::Cancelled) => {
                tally.cancelled = true;
                break;
            }
            Err(FetchFailure::Source(err)) => {
                warn!(source = %source_id, page, error = %err, "page failed; stopping source");
                match err {
                    SourceError::Parse(_) => tally.parse_errors += 1,
                    _ => tally.fetch_errors += 1,
                }
                tally.last_error = Some(err.to_string());
                break;
            }
        };
        tally.pages_fetched += 1;
        tally.listings_found += listing_page.listings.len() as u32;

        let seen_at = Utc::now();
        let mut records = Vec::with_capacity(listing_page.listings.len());
        for raw in &listing_page.listings {
            let fields = match adapter.parse(raw) {
                Ok(fields) => fields,
                Err(err) => {
                    tally.parse_errors += 1;
                    tally.last_error = Some(err.to_string());
                    continue;
                }
            };
            match normalize(&source_id, &fields, seen_at) {
                Ok(record) => records.push(record),
                Err(err) => {
                    if err.is_validation() {
                        tally.validation_errors += 1;
                    } else {
                        tally.parse_errors += 1;
                    }
                    tally.last_error = Some(err.to_string());
                }
            }
        }

        if !records.is_empty() {
            let batch = PageBatch {
                source_id: source_id.clone(),
                records,
            };
            if tx.send(batch).await.is_err() {
                break;
            }
        }
        // an empty page ends pagination even when it claims more
        if !listing_page.has_more || listing_page.listings.is_empty() {
            break;
        }
    }
    tally
}

/// Paced fetch of one page, retrying retryable failures up to the source's
/// retry budget. Shutdown is honored while waiting, never mid-request.
async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    pacer: &mut Pacer,
    page: u32,
    shutdown: &mut Shutdown,
) -> Result<ListingPage, FetchFailure> {
    let max_retries = pacer.policy().max_retries;
    let mut attempt = 0;
    loop {
        tokio::select! {
            _ = pacer.acquire() => {}
            _ = shutdown.wait() => return Err(FetchFailure::Cancelled),
        }
        match adapter.list_page(page).await {
            Ok(listing_page) => {
                pacer.report(FetchOutcome::Ok);
                return Ok(listing_page);
            }
            Err(err) => {
                pacer.report(err.outcome());
                if !err.is_retryable() || attempt >= max_retries {
                    return Err(FetchFailure::Source(err));
                }
                attempt += 1;
                warn!(
                    source = adapter.source_id(),
                    page,
                    attempt,
                    error = %err,
                    multiplier = pacer.multiplier(),
                    "retrying page"
                );
                if shutdown.is_triggered() {
                    return Err(FetchFailure::Cancelled);
                }
            }
        }
    }
}
