//! Storage: the `Storage` contract the pipeline writes through, and its
//! SQLite implementation.
//!
//! - `model`: row view models returned by repository queries.
//! - `repo`: SQL-only functions plus [`SqliteStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{AlertCriteria, ListingKey, ListingRecord, PriceHistoryEntry, ScrapeJob};

pub mod model;
pub mod repo;

pub use model::NotificationForOutbox;
pub use repo::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn find_by_key(&self, key: &ListingKey) -> Result<Option<ListingRecord>, StoreError>;

    async fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError>;

    async fn append_price_history(&self, entry: &PriceHistoryEntry) -> Result<(), StoreError>;

    async fn list_active_alert_criteria(&self) -> Result<Vec<AlertCriteria>, StoreError>;

    /// Insert or update a job row. Once a job leaves `running` it is frozen.
    async fn record_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    /// Oldest-first price history for one listing.
    async fn price_history(&self, key: &ListingKey) -> Result<Vec<PriceHistoryEntry>, StoreError>;

    /// Mark jobs left `running` by a dead process as `failed`.
    async fn fail_stale_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Write a reconciled record together with its history entry, if any.
    async fn commit_reconciliation(
        &self,
        record: &ListingRecord,
        entry: Option<&PriceHistoryEntry>,
    ) -> Result<(), StoreError> {
        self.upsert(record).await?;
        if let Some(entry) = entry {
            self.append_price_history(entry).await?;
        }
        Ok(())
    }
}
