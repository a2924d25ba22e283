use crate::db;
use crate::notify::AlertDelivery;
use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{error, info, instrument, warn};

/// Deliver the oldest due notification, if any. Returns whether a row was
/// processed so the caller can sleep when the queue is idle.
#[instrument(skip_all)]
pub async fn process_next_notification(
    pool: &SqlitePool,
    delivery: &dyn AlertDelivery,
    max_backoff_secs: i64,
    max_attempts: i32,
) -> Result<bool> {
    let now = Utc::now();
    let Some(task) = db::next_due_notification(pool, now).await? else {
        return Ok(false);
    };
    let id = task.id;
    let attempt = task.attempt;
    let alert_id = task.notification.alert_id;

    match delivery.deliver(&task.notification).await {
        Ok(()) => {
            db::delete_notification(pool, id).await?;
            info!(id, alert_id, "notification delivered");
        }
        Err(err) if attempt + 1 >= max_attempts => {
            error!(?err, id, alert_id, attempt, "notification delivery gave up");
            db::mark_notification_failed(pool, id, now, &err.to_string()).await?;
        }
        Err(err) => {
            warn!(?err, id, alert_id, attempt, "notification delivery failed; backoff");
            db::backoff_notification_with_cap(pool, id, attempt, max_backoff_secs, now, &err.to_string())
                .await?;
        }
    }
    Ok(true)
}
