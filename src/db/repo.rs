use super::model::NotificationForOutbox;
use super::{Storage, StoreError};
use crate::model::{
    AlertCriteria, JobStatus, ListingKey, ListingRecord, PriceHistoryEntry,
    PropertyType, ScrapeJob,
};
use crate::notify::AlertNotification;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with stricter durability; writers wait instead of failing on lock.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const LISTING_COLUMNS: &str = "source_id, key_kind, key_value, external_id, title, location_text, \
     property_type, price_minor, area_sqm, bedrooms, bathrooms, url, image_url, content_hash, \
     first_seen_at, last_seen_at";

fn listing_from_row(row: &SqliteRow) -> Result<ListingRecord, StoreError> {
    let property_type: String = row.try_get("property_type")?;
    let property_type = PropertyType::parse(&property_type)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown property type {}", property_type)))?;
    Ok(ListingRecord {
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        location_text: row.try_get("location_text")?,
        property_type,
        price_minor: row.try_get("price_minor")?,
        area_sqm: row.try_get("area_sqm")?,
        bedrooms: row
            .try_get::<Option<i64>, _>("bedrooms")?
            .map(|v| v as u32),
        bathrooms: row
            .try_get::<Option<i64>, _>("bathrooms")?
            .map(|v| v as u32),
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        content_hash: row.try_get("content_hash")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

#[instrument(skip_all)]
pub async fn find_listing(pool: &Pool, key: &ListingKey) -> Result<Option<ListingRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM listings WHERE source_id = ? AND key_kind = ? AND key_value = ?",
        LISTING_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(&key.source_id)
        .bind(key.kind.as_str())
        .bind(&key.value)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(listing_from_row).transpose()
}

async fn upsert_listing_tx(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ListingRecord,
) -> Result<(), StoreError> {
    let key = record.key();
    let sql = format!(
        "INSERT INTO listings ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (source_id, key_kind, key_value) DO UPDATE SET \
           external_id = excluded.external_id, title = excluded.title, \
           location_text = excluded.location_text, property_type = excluded.property_type, \
           price_minor = excluded.price_minor, area_sqm = excluded.area_sqm, \
           bedrooms = excluded.bedrooms, bathrooms = excluded.bathrooms, url = excluded.url, \
           image_url = excluded.image_url, content_hash = excluded.content_hash, \
           last_seen_at = excluded.last_seen_at",
        LISTING_COLUMNS
    );
    sqlx::query(&sql)
        .bind(&key.source_id)
        .bind(key.kind.as_str())
        .bind(&key.value)
        .bind(&record.external_id)
        .bind(&record.title)
        .bind(&record.location_text)
        .bind(record.property_type.as_str())
        .bind(record.price_minor)
        .bind(record.area_sqm)
        .bind(record.bedrooms.map(i64::from))
        .bind(record.bathrooms.map(i64::from))
        .bind(&record.url)
        .bind(&record.image_url)
        .bind(&record.content_hash)
        .bind(record.first_seen_at)
        .bind(record.last_seen_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn append_price_history_tx(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &PriceHistoryEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO price_history (source_id, key_kind, key_value, price_minor, observed_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&entry.key.source_id)
    .bind(entry.key.kind.as_str())
    .bind(&entry.key.value)
    .bind(entry.price_minor)
    .bind(entry.observed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_listing(pool: &Pool, record: &ListingRecord) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    upsert_listing_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_price_history(pool: &Pool, entry: &PriceHistoryEntry) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    append_price_history_tx(&mut tx, entry).await?;
    tx.commit().await?;
    Ok(())
}

/// Record and history entry land in one transaction, so a crash cannot leave
/// a changed price without its history row.
#[instrument(skip_all)]
pub async fn commit_reconciliation(
    pool: &Pool,
    record: &ListingRecord,
    entry: Option<&PriceHistoryEntry>,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    upsert_listing_tx(&mut tx, record).await?;
    if let Some(entry) = entry {
        append_price_history_tx(&mut tx, entry).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn price_history(pool: &Pool, key: &ListingKey) -> Result<Vec<PriceHistoryEntry>, StoreError> {
    let rows = sqlx::query(
        "SELECT price_minor, observed_at FROM price_history \
         WHERE source_id = ? AND key_kind = ? AND key_value = ? ORDER BY id ASC",
    )
    .bind(&key.source_id)
    .bind(key.kind.as_str())
    .bind(&key.value)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(PriceHistoryEntry {
                key: key.clone(),
                price_minor: row.try_get("price_minor")?,
                observed_at: row.try_get("observed_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn count_listings(pool: &Pool) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn criteria_from_row(row: &SqliteRow) -> Result<AlertCriteria, StoreError> {
    let property_type = row
        .try_get::<Option<String>, _>("property_type")?
        .map(|s| {
            PropertyType::parse(&s)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown property type {}", s)))
        })
        .transpose()?;
    Ok(AlertCriteria {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        location_substring: row.try_get("location_substring")?,
        property_type,
        bedrooms_min: row
            .try_get::<Option<i64>, _>("bedrooms_min")?
            .map(|v| v as u32),
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        area_min: row.try_get("area_min")?,
        area_max: row.try_get("area_max")?,
        active: row.try_get("active")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_alert_criteria(pool: &Pool, criteria: &AlertCriteria) -> Result<i64, StoreError> {
    let rec = sqlx::query(
        "INSERT INTO alert_criteria (user_id, name, location_substring, property_type, \
         bedrooms_min, price_min, price_max, area_min, area_max, active) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(criteria.user_id)
    .bind(&criteria.name)
    .bind(&criteria.location_substring)
    .bind(criteria.property_type.map(|t| t.as_str()))
    .bind(criteria.bedrooms_min.map(i64::from))
    .bind(criteria.price_min)
    .bind(criteria.price_max)
    .bind(criteria.area_min)
    .bind(criteria.area_max)
    .bind(criteria.active)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn set_alert_active(pool: &Pool, id: i64, active: bool) -> Result<(), StoreError> {
    sqlx::query("UPDATE alert_criteria SET active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_active_alert_criteria(pool: &Pool) -> Result<Vec<AlertCriteria>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, user_id, name, location_substring, property_type, bedrooms_min, \
         price_min, price_max, area_min, area_max, active \
         FROM alert_criteria WHERE active = 1 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(criteria_from_row).collect()
}

fn job_from_row(row: &SqliteRow) -> Result<ScrapeJob, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {}", status)))?;
    let sites: String = row.try_get("sites")?;
    Ok(ScrapeJob {
        job_id: row.try_get("job_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status,
        sites: serde_json::from_str(&sites)?,
    })
}

#[instrument(skip_all)]
pub async fn record_scrape_job(pool: &Pool, job: &ScrapeJob) -> Result<(), StoreError> {
    let sites = serde_json::to_string(&job.sites)?;
    sqlx::query(
        "INSERT INTO scrape_jobs (job_id, started_at, finished_at, status, sites) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (job_id) DO UPDATE SET finished_at = excluded.finished_at, \
           status = excluded.status, sites = excluded.sites \
         WHERE scrape_jobs.status = 'running'",
    )
    .bind(&job.job_id)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.status.as_str())
    .bind(sites)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn scrape_job(pool: &Pool, job_id: &str) -> Result<Option<ScrapeJob>, StoreError> {
    let row = sqlx::query(
        "SELECT job_id, started_at, finished_at, status, sites FROM scrape_jobs WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn recent_scrape_jobs(pool: &Pool, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
    let rows = sqlx::query(
        "SELECT job_id, started_at, finished_at, status, sites FROM scrape_jobs \
         ORDER BY datetime(started_at) DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

#[instrument(skip_all)]
pub async fn fail_stale_jobs(pool: &Pool, now: DateTime<Utc>) -> Result<u64, StoreError> {
    let res = sqlx::query(
        "UPDATE scrape_jobs SET status = 'failed', finished_at = ? WHERE status = 'running'",
    )
    .bind(now)
    .execute(pool)
    .await?;
    if res.rows_affected() > 0 {
        info!(count = res.rows_affected(), "marked stale running jobs as failed");
    }
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn enqueue_notification(
    pool: &Pool,
    notification: &AlertNotification,
    due_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let payload = serde_json::to_string(notification)?;
    let rec = sqlx::query(
        "INSERT INTO notifications (alert_id, user_id, listing_key, payload, attempt, due_at) \
         VALUES (?, ?, ?, ?, 0, ?) RETURNING id",
    )
    .bind(notification.alert_id)
    .bind(notification.user_id)
    .bind(notification.listing.key().to_string())
    .bind(payload)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_notification(
    pool: &Pool,
    now: DateTime<Utc>,
) -> Result<Option<NotificationForOutbox>, StoreError> {
    let row = sqlx::query(
        "SELECT id, attempt, payload FROM notifications \
         WHERE failed_at IS NULL AND datetime(due_at) <= datetime(?) \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let payload: String = row.try_get("payload")?;
    Ok(Some(NotificationForOutbox {
        id: row.try_get("id")?,
        attempt: row.try_get("attempt")?,
        notification: serde_json::from_str(&payload)?,
    }))
}

#[instrument(skip_all)]
pub async fn delete_notification(pool: &Pool, id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM notifications WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (if > 0).
pub fn notification_backoff_secs(attempt: i32, max_cap_secs: i64) -> i64 {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 20));
    if max_cap_secs > 0 {
        secs.min(max_cap_secs)
    } else {
        secs
    }
}

#[instrument(skip_all)]
pub async fn backoff_notification_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    now: DateTime<Utc>,
    error: &str,
) -> Result<(), StoreError> {
    let secs = notification_backoff_secs(attempt, max_cap_secs);
    sqlx::query("UPDATE notifications SET attempt = ?, due_at = ?, last_error = ? WHERE id = ?")
        .bind(attempt + 1)
        .bind(now + ChronoDuration::seconds(secs))
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_notification_failed(
    pool: &Pool,
    id: i64,
    now: DateTime<Utc>,
    error: &str,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE notifications SET failed_at = ?, last_error = ? WHERE id = ?")
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_pending_notifications(pool: &Pool) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE failed_at IS NULL")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// [`Storage`] backed by a SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn find_by_key(&self, key: &ListingKey) -> Result<Option<ListingRecord>, StoreError> {
        find_listing(&self.pool, key).await
    }

    async fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        upsert_listing(&self.pool, record).await
    }

    async fn append_price_history(&self, entry: &PriceHistoryEntry) -> Result<(), StoreError> {
        append_price_history(&self.pool, entry).await
    }

    async fn list_active_alert_criteria(&self) -> Result<Vec<AlertCriteria>, StoreError> {
        list_active_alert_criteria(&self.pool).await
    }

    async fn record_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        record_scrape_job(&self.pool, job).await
    }

    async fn price_history(&self, key: &ListingKey) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        price_history(&self.pool, key).await
    }

    async fn fail_stale_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        fail_stale_jobs(&self.pool, now).await
    }

    async fn commit_reconciliation(
        &self,
        record: &ListingRecord,
        entry: Option<&PriceHistoryEntry>,
    ) -> Result<(), StoreError> {
        commit_reconciliation(&self.pool, record, entry).await
    }
}
