use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::info;

use crate::config::{DeliveryKind, Notifications};
use crate::db;
use crate::model::{AlertCriteria, ListingRecord};

/// Receives alert matches during a run. Implementations must return quickly;
/// the coordinator logs failures and carries on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, criteria: &AlertCriteria, listing: &ListingRecord) -> Result<()>;
}

/// Payload persisted in the outbox and handed to deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_id: i64,
    pub alert_name: String,
    pub user_id: i64,
    pub listing: ListingRecord,
    pub matched_at: DateTime<Utc>,
}

impl AlertNotification {
    pub fn new(criteria: &AlertCriteria, listing: &ListingRecord, matched_at: DateTime<Utc>) -> Self {
        Self {
            alert_id: criteria.id,
            alert_name: criteria.name.clone(),
            user_id: criteria.user_id,
            listing: listing.clone(),
            matched_at,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "[{}] {} | {} | {} VND | {:.1} m2 | {}",
            self.alert_name,
            self.listing.title,
            self.listing.location_text,
            self.listing.price_minor,
            self.listing.area_sqm,
            self.listing.url
        )
    }
}

/// Queues matches in the `notifications` table for the delivery worker.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    pool: SqlitePool,
}

impl OutboxNotifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify(&self, criteria: &AlertCriteria, listing: &ListingRecord) -> Result<()> {
        let now = Utc::now();
        let notification = AlertNotification::new(criteria, listing, now);
        db::enqueue_notification(&self.pool, &notification, now)
            .await
            .context("failed to enqueue notification")?;
        Ok(())
    }
}

#[async_trait]
pub trait AlertDelivery: Send + Sync {
    async fn deliver(&self, notification: &AlertNotification) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl AlertDelivery for LogDelivery {
    async fn deliver(&self, notification: &AlertNotification) -> Result<()> {
        info!(
            alert_id = notification.alert_id,
            user_id = notification.user_id,
            listing = %notification.listing.key(),
            "{}",
            notification.summary()
        );
        Ok(())
    }
}

/// POSTs each notification as JSON. Any non-2xx response is a failure.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    http: Client,
    url: Url,
}

impl WebhookDelivery {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid webhook url {}", url))?;
        let http = Client::builder()
            .user_agent(concat!("listing-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build webhook client")?;
        Ok(Self { http, url })
    }

    pub fn build_request(&self, notification: &AlertNotification) -> Result<reqwest::Request> {
        self.http
            .post(self.url.clone())
            .json(notification)
            .build()
            .context("failed to build webhook request")
    }
}

#[async_trait]
impl AlertDelivery for WebhookDelivery {
    async fn deliver(&self, notification: &AlertNotification) -> Result<()> {
        let request = self.build_request(notification)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

pub fn delivery_from_config(cfg: &Notifications) -> Result<Box<dyn AlertDelivery>> {
    match cfg.delivery {
        DeliveryKind::Log => Ok(Box::new(LogDelivery)),
        DeliveryKind::Webhook => {
            let url = cfg
                .webhook_url
                .as_deref()
                .ok_or_else(|| anyhow!("webhook delivery requires webhook_url"))?;
            Ok(Box::new(WebhookDelivery::new(url)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyType;
    use sqlx::sqlite::SqlitePoolOptions;

    fn listing() -> ListingRecord {
        let now = Utc::now();
        ListingRecord {
            source_id: "siteX".into(),
            external_id: Some("123".into()),
            title: "Căn hộ".into(),
            location_text: "Quận 2".into(),
            property_type: PropertyType::Apartment,
            price_minor: 3_100_000_000,
            area_sqm: 85.0,
            bedrooms: Some(3),
            bathrooms: None,
            url: "https://x/123".into(),
            image_url: None,
            content_hash: "h".into(),
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    #[tokio::test]
    async fn outbox_notifier_enqueues_payload() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let mut criteria = AlertCriteria::new(7, "budget");
        criteria.id = 3;
        let listing = listing();
        let notifier = OutboxNotifier::new(pool.clone());
        notifier.notify(&criteria, &listing).await.unwrap();

        let next = db::next_due_notification(&pool, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.attempt, 0);
        assert_eq!(next.notification.alert_id, 3);
        assert_eq!(next.notification.user_id, 7);
        assert_eq!(next.notification.listing, listing);
    }

    #[test]
    fn webhook_request_is_json_post() {
        let delivery = WebhookDelivery::new("https://hooks.example.test/alerts").unwrap();
        let n = AlertNotification::new(&AlertCriteria::new(1, "all"), &listing(), Utc::now());
        let req = delivery.build_request(&n).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://hooks.example.test/alerts");
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let parsed: AlertNotification = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn delivery_selection() {
        let mut cfg = Notifications::default();
        assert!(delivery_from_config(&cfg).is_ok());
        cfg.delivery = DeliveryKind::Webhook;
        assert!(delivery_from_config(&cfg).is_err());
        cfg.webhook_url = Some("https://hooks.example.test/x".into());
        assert!(delivery_from_config(&cfg).is_ok());
    }
}
