use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Townhouse,
    Land,
    Other,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Apartment => "apartment",
            PropertyType::House => "house",
            PropertyType::Townhouse => "townhouse",
            PropertyType::Land => "land",
            PropertyType::Other => "other",
        }
    }

    /// Parse the canonical storage name. Free-text labels go through
    /// `normalize::property_type_from_label` instead.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "apartment" => Some(PropertyType::Apartment),
            "house" => Some(PropertyType::House),
            "townhouse" => Some(PropertyType::Townhouse),
            "land" => Some(PropertyType::Land),
            "other" => Some(PropertyType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    External,
    Content,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::External => "ext",
            KeyKind::Content => "hash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ext" => Some(KeyKind::External),
            "hash" => Some(KeyKind::Content),
            _ => None,
        }
    }
}

/// Natural key of a listing: `(source, external id)` or, when the source gives
/// no usable id, `(source, content hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub source_id: String,
    pub kind: KeyKind,
    pub value: String,
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source_id, self.kind.as_str(), self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub location_text: String,
    pub property_type: PropertyType,
    pub price_minor: i64,
    pub area_sqm: f64,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub url: String,
    pub image_url: Option<String>,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn key(&self) -> ListingKey {
        match self.external_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => ListingKey {
                source_id: self.source_id.clone(),
                kind: KeyKind::External,
                value: id.to_string(),
            },
            None => ListingKey {
                source_id: self.source_id.clone(),
                kind: KeyKind::Content,
                value: self.content_hash.clone(),
            },
        }
    }

    pub fn price_per_sqm(&self) -> f64 {
        if self.area_sqm > 0.0 {
            self.price_minor as f64 / self.area_sqm
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub key: ListingKey,
    pub price_minor: i64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "partial" => Some(JobStatus::Partial),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    #[default]
    Succeeded,
    Partial,
    Failed,
}

/// Per-source counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJobSiteResult {
    pub status: SiteStatus,
    pub pages_fetched: u32,
    pub listings_found: u32,
    pub listings_new: u32,
    pub listings_updated: u32,
    pub listings_unchanged: u32,
    pub alerts_emitted: u32,
    pub errors: u32,
    pub fetch_errors: u32,
    pub parse_errors: u32,
    pub validation_errors: u32,
    pub persistence_errors: u32,
    pub cancelled: bool,
    pub last_error: Option<String>,
}

impl ScrapeJobSiteResult {
    /// Derive the site status from the accumulated counters. A source that
    /// never delivered a page, or whose writes failed, failed outright.
    pub fn finalize(&mut self) {
        self.errors = self.fetch_errors
            + self.parse_errors
            + self.validation_errors
            + self.persistence_errors;
        self.status = if self.pages_fetched == 0 && (self.errors > 0 || self.cancelled)
            || self.persistence_errors > 0
        {
            SiteStatus::Failed
        } else if self.errors > 0 || self.cancelled {
            SiteStatus::Partial
        } else {
            SiteStatus::Succeeded
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub sites: BTreeMap<String, ScrapeJobSiteResult>,
}

impl ScrapeJob {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: None,
            status: JobStatus::Running,
            sites: BTreeMap::new(),
        }
    }

    /// Close the job: all sites succeeded → succeeded, all failed → failed,
    /// anything else → partial.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        let total = self.sites.len();
        let failed = self
            .sites
            .values()
            .filter(|s| s.status == SiteStatus::Failed)
            .count();
        let succeeded = self
            .sites
            .values()
            .filter(|s| s.status == SiteStatus::Succeeded)
            .count();
        self.status = if succeeded == total {
            JobStatus::Succeeded
        } else if failed == total {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        };
        self.finished_at = Some(finished_at);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCriteria {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub location_substring: Option<String>,
    pub property_type: Option<PropertyType>,
    pub bedrooms_min: Option<u32>,
    pub price_min: Option<i64>,
    pub price_max: Option<i64>,
    pub area_min: Option<f64>,
    pub area_max: Option<f64>,
    pub active: bool,
}

impl AlertCriteria {
    /// Blank, active criteria that matches everything.
    pub fn new(user_id: i64, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_id,
            name: name.into(),
            location_substring: None,
            property_type: None,
            bedrooms_min: None,
            price_min: None,
            price_max: None,
            area_min: None,
            area_max: None,
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(status: SiteStatus) -> ScrapeJobSiteResult {
        ScrapeJobSiteResult {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn key_falls_back_to_content_hash() {
        let now = Utc::now();
        let mut rec = ListingRecord {
            source_id: "siteX".into(),
            external_id: Some("123".into()),
            title: "t".into(),
            location_text: "l".into(),
            property_type: PropertyType::Apartment,
            price_minor: 1,
            area_sqm: 1.0,
            bedrooms: None,
            bathrooms: None,
            url: "u".into(),
            image_url: None,
            content_hash: "abc".into(),
            first_seen_at: now,
            last_seen_at: now,
        };
        assert_eq!(rec.key().to_string(), "siteX:ext:123");
        rec.external_id = None;
        assert_eq!(rec.key().to_string(), "siteX:hash:abc");
        rec.external_id = Some(String::new());
        assert_eq!(rec.key().kind, KeyKind::Content);
    }

    #[test]
    fn job_status_rollup() {
        let mut job = ScrapeJob::start(Utc::now());
        job.sites.insert("a".into(), site(SiteStatus::Succeeded));
        job.sites.insert("b".into(), site(SiteStatus::Succeeded));
        job.finish(Utc::now());
        assert_eq!(job.status, JobStatus::Succeeded);

        job.sites.insert("b".into(), site(SiteStatus::Failed));
        job.finish(Utc::now());
        assert_eq!(job.status, JobStatus::Partial);

        job.sites.insert("a".into(), site(SiteStatus::Failed));
        job.finish(Utc::now());
        assert_eq!(job.status, JobStatus::Failed);

        job.sites.insert("a".into(), site(SiteStatus::Partial));
        job.sites.insert("b".into(), site(SiteStatus::Partial));
        job.finish(Utc::now());
        assert_eq!(job.status, JobStatus::Partial);
    }

    #[test]
    fn site_finalize() {
        let mut s = ScrapeJobSiteResult {
            pages_fetched: 2,
            ..Default::default()
        };
        s.finalize();
        assert_eq!(s.status, SiteStatus::Succeeded);

        s.parse_errors = 1;
        s.finalize();
        assert_eq!(s.status, SiteStatus::Partial);
        assert_eq!(s.errors, 1);

        let mut s = ScrapeJobSiteResult {
            fetch_errors: 1,
            ..Default::default()
        };
        s.finalize();
        assert_eq!(s.status, SiteStatus::Failed);

        let mut s = ScrapeJobSiteResult {
            pages_fetched: 3,
            persistence_errors: 1,
            ..Default::default()
        };
        s.finalize();
        assert_eq!(s.status, SiteStatus::Failed);
    }
}
