//! Source adapters: fetch raw listing pages and lift raw payloads into
//! candidate fields. Site-specific scraping lives behind [`SourceAdapter`];
//! the two adapters here are generic JSON readers driven by a [`FieldMap`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, SourceConfig, SourceKind};
use crate::ratelimit::{FetchOutcome, Politeness};

pub mod feed;
pub mod http;

pub use feed::FileFeedAdapter;
pub use http::HttpJsonAdapter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error: HTTP {status}")]
    Server { status: u16 },
    #[error("client error: HTTP {status}")]
    Client { status: u16 },
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed payload: {0}")]
    Parse(String),
}

impl SourceError {
    /// What the pacer should learn from this failure. A parse failure means
    /// the source answered, so pacing treats it as a successful request.
    pub fn outcome(&self) -> FetchOutcome {
        match self {
            SourceError::Fetch(_) | SourceError::Server { .. } => FetchOutcome::ServerError,
            SourceError::RateLimited { retry_after } => FetchOutcome::Throttled {
                retry_after: *retry_after,
            },
            SourceError::Client { .. } | SourceError::Unavailable(_) => FetchOutcome::ClientError,
            SourceError::Parse(_) => FetchOutcome::Ok,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.outcome().is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawListing {
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListingPage {
    pub listings: Vec<RawListing>,
    pub has_more: bool,
}

/// Text fields an adapter extracts from one raw listing, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateFields {
    pub title: Option<String>,
    pub location: Option<String>,
    pub price_text: Option<String>,
    pub area_text: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub external_id: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Upper bound on pages fetched per run.
    fn max_pages(&self) -> u32;

    /// Fetch one page (1-based).
    async fn list_page(&self, page: u32) -> Result<ListingPage, SourceError>;

    fn parse(&self, raw: &RawListing) -> Result<CandidateFields, SourceError>;
}

/// Where each canonical field lives in a raw JSON listing. Values are object
/// keys or dotted paths (`price.text`, `images.0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub title: String,
    pub location: String,
    pub price: String,
    pub area: String,
    pub property_type: String,
    pub bedrooms: String,
    pub bathrooms: String,
    pub url: String,
    pub image_url: String,
    pub external_id: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            title: "title".into(),
            location: "location".into(),
            price: "price".into(),
            area: "area".into(),
            property_type: "property_type".into(),
            bedrooms: "bedrooms".into(),
            bathrooms: "bathrooms".into(),
            url: "url".into(),
            image_url: "image_url".into(),
            external_id: "id".into(),
        }
    }
}

impl FieldMap {
    pub fn extract(&self, raw: &RawListing) -> Result<CandidateFields, SourceError> {
        if !raw.payload.is_object() {
            return Err(SourceError::Parse(format!(
                "listing is not a JSON object: {}",
                truncate(&raw.payload.to_string(), 80)
            )));
        }
        let get = |path: &str| lookup(&raw.payload, path).and_then(value_text);
        Ok(CandidateFields {
            title: get(&self.title),
            location: get(&self.location),
            price_text: get(&self.price),
            area_text: get(&self.area),
            property_type: get(&self.property_type),
            bedrooms: get(&self.bedrooms),
            bathrooms: get(&self.bathrooms),
            url: get(&self.url),
            image_url: get(&self.image_url),
            external_id: get(&self.external_id),
        })
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Decode a page body: either a bare array of listings, or an object holding
/// the array under `listings`/`items`/`data` with an optional
/// `has_more`/`hasMore` flag. Without a flag, a non-empty page implies more.
pub fn parse_page_body(body: &Value) -> Result<ListingPage, SourceError> {
    let (items, flag) = match body {
        Value::Array(items) => (items, None),
        Value::Object(map) => {
            let items = ["listings", "items", "data"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array))
                .ok_or_else(|| SourceError::Parse("page has no listings array".into()))?;
            let flag = ["has_more", "hasMore"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_bool));
            (items, flag)
        }
        _ => return Err(SourceError::Parse("page body is not JSON array/object".into())),
    };
    let listings: Vec<RawListing> = items
        .iter()
        .cloned()
        .map(|payload| RawListing { payload })
        .collect();
    let has_more = flag.unwrap_or(!listings.is_empty());
    Ok(ListingPage { listings, has_more })
}

/// A configured source: its adapter and the pacing policy for its worker.
#[derive(Clone)]
pub struct SourceSlot {
    pub adapter: Arc<dyn SourceAdapter>,
    pub politeness: Politeness,
}

/// Build adapters for every enabled source in the config.
pub fn from_config(cfg: &Config) -> anyhow::Result<Vec<SourceSlot>> {
    cfg.sources
        .iter()
        .filter(|s| s.enabled)
        .map(|s| {
            let politeness = s.politeness(&cfg.politeness);
            let max_pages = s.max_pages.unwrap_or(cfg.politeness.max_pages);
            Ok(SourceSlot {
                adapter: build_adapter(s, max_pages)?,
                politeness,
            })
        })
        .collect()
}

fn build_adapter(s: &SourceConfig, max_pages: u32) -> anyhow::Result<Arc<dyn SourceAdapter>> {
    Ok(match s.kind {
        SourceKind::HttpJson => {
            let url = s
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("source {} needs url", s.id))?;
            Arc::new(
                HttpJsonAdapter::new(
                    &s.id,
                    url,
                    s.page_param.as_deref().unwrap_or("page"),
                    s.fields.clone(),
                    max_pages,
                )?
                .respect_robots(s.respect_robots),
            )
        }
        SourceKind::FileFeed => {
            let path = s
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("source {} needs path", s.id))?;
            Arc::new(FileFeedAdapter::new(&s.id, path, s.fields.clone(), max_pages))
        }
    })
}
