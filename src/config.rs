//! Configuration loader and validator for the listing watcher.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::Politeness;
use crate::sources::FieldMap;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub politeness: PolitenessDefaults,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub notifications: Notifications,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub scrape_interval_minutes: u64,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Politeness defaults applied to every source unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolitenessDefaults {
    pub delay_range_seconds: [f64; 2],
    pub max_pages: u32,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_cap_seconds: f64,
}

impl Default for PolitenessDefaults {
    fn default() -> Self {
        Self {
            delay_range_seconds: [2.0, 5.0],
            max_pages: 10,
            max_retries: 3,
            backoff_factor: 2.0,
            backoff_cap_seconds: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HttpJson,
    FileFeed,
}

/// One listing source. Politeness fields left unset inherit the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub page_param: Option<String>,
    /// Consult `{origin}/robots.txt` before the first page of each run.
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub delay_range_seconds: Option<[f64; 2]>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_factor: Option<f64>,
    #[serde(default)]
    pub backoff_cap_seconds: Option<f64>,
}

impl SourceConfig {
    pub fn politeness(&self, defaults: &PolitenessDefaults) -> Politeness {
        let [min, max] = self
            .delay_range_seconds
            .unwrap_or(defaults.delay_range_seconds);
        Politeness {
            delay_min: Duration::from_secs_f64(min),
            delay_max: Duration::from_secs_f64(max),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_factor: self.backoff_factor.unwrap_or(defaults.backoff_factor),
            backoff_cap: Duration::from_secs_f64(
                self.backoff_cap_seconds
                    .unwrap_or(defaults.backoff_cap_seconds),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    #[default]
    Log,
    Webhook,
}

/// Alert notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Notifications {
    pub delivery: DeliveryKind,
    pub webhook_url: Option<String>,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_attempts: u32,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            delivery: DeliveryKind::Log,
            webhook_url: None,
            poll_interval_ms: 500,
            max_backoff_seconds: 600,
            max_attempts: 8,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_sources() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    64
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.app.scrape_interval_minutes * 60)
    }

    /// `DATABASE_URL` wins; otherwise a file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/listings.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.scrape_interval_minutes == 0 {
        return Err(invalid("app.scrape_interval_minutes must be > 0"));
    }
    if cfg.app.max_concurrent_sources == 0 {
        return Err(invalid("app.max_concurrent_sources must be > 0"));
    }
    if cfg.app.channel_capacity == 0 {
        return Err(invalid("app.channel_capacity must be > 0"));
    }

    validate_politeness(
        "politeness",
        Some(cfg.politeness.delay_range_seconds),
        Some(cfg.politeness.max_pages),
        Some(cfg.politeness.backoff_factor),
        Some(cfg.politeness.backoff_cap_seconds),
    )?;

    let mut seen = HashSet::new();
    for s in &cfg.sources {
        if s.id.trim().is_empty() {
            return Err(invalid("sources[].id must be non-empty"));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(invalid(format!("duplicate source id {}", s.id)));
        }
        let prefix = format!("sources.{}", s.id);
        match s.kind {
            SourceKind::HttpJson if s.url.as_deref().map_or(true, |u| u.trim().is_empty()) => {
                return Err(invalid(format!("{}.url is required for http_json", prefix)));
            }
            SourceKind::FileFeed if s.path.as_deref().map_or(true, |p| p.trim().is_empty()) => {
                return Err(invalid(format!("{}.path is required for file_feed", prefix)));
            }
            _ => {}
        }
        validate_politeness(
            &prefix,
            s.delay_range_seconds,
            s.max_pages,
            s.backoff_factor,
            s.backoff_cap_seconds,
        )?;
    }

    if cfg.notifications.delivery == DeliveryKind::Webhook
        && cfg
            .notifications
            .webhook_url
            .as_deref()
            .map_or(true, |u| u.trim().is_empty())
    {
        return Err(invalid("notifications.webhook_url is required for webhook delivery"));
    }
    if cfg.notifications.poll_interval_ms == 0 {
        return Err(invalid("notifications.poll_interval_ms must be > 0"));
    }

    Ok(())
}

fn validate_politeness(
    prefix: &str,
    delay: Option<[f64; 2]>,
    max_pages: Option<u32>,
    backoff_factor: Option<f64>,
    backoff_cap: Option<f64>,
) -> Result<(), ConfigError> {
    if let Some([min, max]) = delay {
        if !(min.is_finite() && max.is_finite() && min >= 0.0 && min <= max) {
            return Err(invalid(format!(
                "{}.delay_range_seconds must satisfy 0 <= min <= max",
                prefix
            )));
        }
    }
    if max_pages == Some(0) {
        return Err(invalid(format!("{}.max_pages must be >= 1", prefix)));
    }
    if let Some(f) = backoff_factor {
        if !(f.is_finite() && f >= 1.0) {
            return Err(invalid(format!("{}.backoff_factor must be >= 1", prefix)));
        }
    }
    if let Some(c) = backoff_cap {
        if !(c.is_finite() && c > 0.0) {
            return Err(invalid(format!("{}.backoff_cap_seconds must be > 0", prefix)));
        }
    }
    Ok(())
}

/// Example configuration; kept valid by the tests below.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  scrape_interval_minutes: 360
  run_on_start: true
  max_concurrent_sources: 4
  channel_capacity: 64

politeness:
  delay_range_seconds: [2.0, 5.0]
  max_pages: 10
  max_retries: 3
  backoff_factor: 2.0
  backoff_cap_seconds: 60.0

sources:
  - id: batdongsan
    kind: http_json
    url: "https://listings.example.com/api/batdongsan"
    page_param: page
    respect_robots: true
    delay_range_seconds: [3.0, 6.0]
    fields:
      title: title
      location: address
      price: price_text
      area: area_text
      property_type: category
      url: link
      image_url: images.0
      external_id: product_id
  - id: chotot
    kind: file_feed
    path: "./feeds/chotot"
    delay_range_seconds: [2.0, 4.0]
    fields:
      external_id: list_id
      price: price_string
      area: size

notifications:
  delivery: log
  poll_interval_ms: 500
  max_backoff_seconds: 600
  max_attempts: 8
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].fields.location, "address");
        assert_eq!(cfg.sources[0].fields.bedrooms, "bedrooms");
        assert!(cfg.sources[0].respect_robots);
        assert_eq!(cfg.scrape_interval(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "app:\n  data_dir: ./d\n  scrape_interval_minutes: 5\n",
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.sources.is_empty());
        assert!(cfg.app.run_on_start);
        assert_eq!(cfg.app.max_concurrent_sources, 4);
        assert_eq!(cfg.politeness, PolitenessDefaults::default());
        assert_eq!(cfg.notifications.delivery, DeliveryKind::Log);
    }

    #[test]
    fn source_overrides_merge_with_defaults() {
        let cfg = example_cfg();
        let p = cfg.sources[0].politeness(&cfg.politeness);
        assert_eq!(p.delay_min, Duration::from_secs(3));
        assert_eq!(p.delay_max, Duration::from_secs(6));
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.backoff_cap, Duration::from_secs(60));
    }

    #[test]
    fn invalid_delay_range() {
        let mut cfg = example_cfg();
        cfg.sources[1].delay_range_seconds = Some([5.0, 1.0]);
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("sources.chotot.delay_range_seconds")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_sources() {
        let mut cfg = example_cfg();
        cfg.sources[1].id = "batdongsan".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("duplicate")));

        let mut cfg = example_cfg();
        cfg.sources[0].url = None;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("url")));

        let mut cfg = example_cfg();
        cfg.sources[1].path = Some("  ".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("path")));

        let mut cfg = example_cfg();
        cfg.politeness.max_pages = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("max_pages")));

        let mut cfg = example_cfg();
        cfg.sources[0].backoff_factor = Some(0.5);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_app_and_notifications() {
        let mut cfg = example_cfg();
        cfg.app.scrape_interval_minutes = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.notifications.delivery = DeliveryKind::Webhook;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("webhook_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.sources[1].kind, SourceKind::FileFeed);
    }
}
