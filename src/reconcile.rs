use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::db::{Storage, StoreError};
use crate::model::{ListingKey, ListingRecord, PriceHistoryEntry};

const DEFAULT_SHARDS: usize = 64;
const AREA_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Inserted,
    Updated { price_changed: bool },
    Unchanged,
}

impl Reconciliation {
    /// Whether this outcome should be shown to the alert matcher.
    pub fn is_alertable(&self) -> bool {
        matches!(
            self,
            Reconciliation::Inserted
                | Reconciliation::Updated {
                    price_changed: true
                }
        )
    }
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub outcome: Reconciliation,
    /// The record as stored after reconciliation.
    pub record: ListingRecord,
}

/// Sharded lock table. Two keys may share a shard; one key never spans two.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_for(&self, key: &ListingKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub fn lock_for(&self, key: &ListingKey) -> &Mutex<()> {
        &self.shards[self.shard_for(key)]
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

/// Deduplicator and price-history tracker. The only writer of listings.
pub struct Reconciler {
    store: Arc<dyn Storage>,
    locks: KeyLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    /// Compare a freshly normalized candidate with the stored record under the
    /// same natural key and persist the difference. `candidate.last_seen_at`
    /// is taken as the observation time.
    pub async fn reconcile(&self, candidate: ListingRecord) -> Result<Reconciled, StoreError> {
        let key = candidate.key();
        let _guard = self.locks.lock_for(&key).lock().await;
        let now = candidate.last_seen_at;

        let Some(stored) = self.store.find_by_key(&key).await? else {
            let mut record = candidate;
            record.first_seen_at = now;
            record.last_seen_at = now;
            let opening = PriceHistoryEntry {
                key: key.clone(),
                price_minor: record.price_minor,
                observed_at: now,
            };
            self.store
                .commit_reconciliation(&record, Some(&opening))
                .await?;
            debug!(key = %key, price = record.price_minor, "listing inserted");
            return Ok(Reconciled {
                outcome: Reconciliation::Inserted,
                record,
            });
        };

        let seen_at = now.max(stored.last_seen_at);
        let price_changed = stored.price_minor != candidate.price_minor;
        let fields_changed = !same_content(&stored, &candidate);

        let mut record = candidate;
        record.first_seen_at = stored.first_seen_at;
        record.last_seen_at = seen_at;

        let entry = price_changed.then(|| PriceHistoryEntry {
            key: key.clone(),
            price_minor: record.price_minor,
            observed_at: seen_at,
        });
        self.store
            .commit_reconciliation(&record, entry.as_ref())
            .await?;

        let outcome = if price_changed {
            debug!(
                key = %key,
                old = stored.price_minor,
                new = record.price_minor,
                "listing price changed"
            );
            Reconciliation::Updated {
                price_changed: true,
            }
        } else if fields_changed {
            Reconciliation::Updated {
                price_changed: false,
            }
        } else {
            Reconciliation::Unchanged
        };
        Ok(Reconciled { outcome, record })
    }
}

/// Field equality ignoring price and bookkeeping timestamps.
fn same_content(a: &ListingRecord, b: &ListingRecord) -> bool {
    a.title == b.title
        && a.location_text == b.location_text
        && a.property_type == b.property_type
        && (a.area_sqm - b.area_sqm).abs() <= AREA_TOLERANCE
        && a.bedrooms == b.bedrooms
        && a.bathrooms == b.bathrooms
        && a.url == b.url
        && a.image_url == b.image_url
}
