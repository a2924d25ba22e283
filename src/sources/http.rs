use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    parse_page_body, CandidateFields, FieldMap, ListingPage, RawListing, SourceAdapter, SourceError,
};

const USER_AGENT: &str = "listing-watchbot/0.1 (+polite; contact operator)";
/// Product token looked up in `User-agent` lines of robots.txt.
const ROBOT_NAME: &str = "listing-watchbot";

/// Paginated JSON endpoint: `GET {url}?{page_param}={n}`.
///
/// When `respect_robots` is on, `{origin}/robots.txt` is read before page 1
/// of every run. A disallowed listing path fails the source before any page
/// is requested; an unreachable robots.txt allows scraping.
#[derive(Clone)]
pub struct HttpJsonAdapter {
    source_id: String,
    http: Client,
    base_url: Url,
    page_param: String,
    fields: FieldMap,
    max_pages: u32,
    respect_robots: bool,
}

impl fmt::Debug for HttpJsonAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpJsonAdapter")
            .field("source_id", &self.source_id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpJsonAdapter {
    pub fn new(
        source_id: &str,
        url: &str,
        page_param: &str,
        fields: FieldMap,
        max_pages: u32,
    ) -> Result<Self> {
        let base_url = Url::parse(url).with_context(|| format!("invalid source url {}", url))?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            source_id: source_id.to_string(),
            http,
            base_url,
            page_param: page_param.to_string(),
            fields,
            max_pages,
            respect_robots: true,
        })
    }

    pub fn respect_robots(mut self, on: bool) -> Self {
        self.respect_robots = on;
        self
    }

    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(&self.page_param, &page.to_string());
        url
    }

    async fn check_robots(&self) -> Result<(), SourceError> {
        let robots_url = match self.base_url.join("/robots.txt") {
            Ok(url) => url,
            Err(err) => {
                warn!(source = %self.source_id, ?err, "no robots.txt url; assuming allowed");
                return Ok(());
            }
        };
        let res = match self
            .http
            .get(robots_url.clone())
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(res) if res.status().is_success() => res,
            Ok(res) => {
                debug!(source = %self.source_id, status = %res.status(), "no robots.txt; assuming allowed");
                return Ok(());
            }
            Err(err) => {
                warn!(source = %self.source_id, %err, "robots.txt unreachable; assuming allowed");
                return Ok(());
            }
        };
        let body = match res.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(source = %self.source_id, %err, "robots.txt unreadable; assuming allowed");
                return Ok(());
            }
        };

        let target = request_target(&self.page_url(1));
        if robots_allows(&body, ROBOT_NAME, &target) {
            debug!(source = %self.source_id, %robots_url, "robots.txt allows listing path");
            Ok(())
        } else {
            warn!(source = %self.source_id, %target, "listing path disallowed by robots.txt");
            Err(SourceError::Unavailable(format!(
                "{} disallows {}",
                robots_url, target
            )))
        }
    }
}

fn request_target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[derive(Debug, Default)]
struct RobotsGroup {
    agents: Vec<String>,
    /// `(allow, pattern)`
    rules: Vec<(bool, String)>,
}

fn robots_groups(robots: &str) -> Vec<RobotsGroup> {
    let mut groups: Vec<RobotsGroup> = Vec::new();
    // consecutive User-agent lines share one group
    let mut collecting_agents = false;
    for line in robots.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "user-agent" => {
                let agent = value.to_ascii_lowercase();
                match groups.last_mut() {
                    Some(group) if collecting_agents => group.agents.push(agent),
                    _ => groups.push(RobotsGroup {
                        agents: vec![agent],
                        ..Default::default()
                    }),
                }
                collecting_agents = true;
            }
            "allow" | "disallow" => {
                collecting_agents = false;
                if let Some(group) = groups.last_mut() {
                    // an empty Disallow allows everything
                    if !value.is_empty() {
                        group.rules.push((key == "allow", value.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
    groups
}

/// `*` matches any run of characters; a trailing `$` anchors the pattern.
fn robots_pattern_matches(pattern: &str, target: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some((first, tail)) = parts.split_first() else {
        return false;
    };
    let Some(mut rest) = target.strip_prefix(*first) else {
        return false;
    };
    let Some((last, middle)) = tail.split_last() else {
        return !anchored || rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    if anchored {
        rest.ends_with(last)
    } else {
        rest.contains(last)
    }
}

/// Whether `robots` lets `agent` fetch `target` (path plus query).
///
/// Rules come from the groups naming the agent, or the `*` groups when none
/// do. The longest matching pattern decides and `Allow` wins a tie.
pub fn robots_allows(robots: &str, agent: &str, target: &str) -> bool {
    let agent = agent.to_ascii_lowercase();
    let groups = robots_groups(robots);
    let names_agent = |g: &&RobotsGroup| {
        g.agents
            .iter()
            .any(|a| !a.is_empty() && a != "*" && agent.contains(a.as_str()))
    };
    let mut chosen: Vec<&RobotsGroup> = groups.iter().filter(names_agent).collect();
    if chosen.is_empty() {
        chosen = groups
            .iter()
            .filter(|g| g.agents.iter().any(|a| a == "*"))
            .collect();
    }
    chosen
        .iter()
        .flat_map(|g| g.rules.iter())
        .filter(|(_, pattern)| robots_pattern_matches(pattern, target))
        .max_by_key(|(allow, pattern)| (pattern.len(), *allow))
        .map_or(true, |(allow, _)| *allow)
}

/// Map a non-success status onto the fetch error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<SourceError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(SourceError::RateLimited { retry_after })
    } else if status.is_server_error() {
        Some(SourceError::Server {
            status: status.as_u16(),
        })
    } else {
        Some(SourceError::Client {
            status: status.as_u16(),
        })
    }
}

fn retry_after(res: &Response) -> Option<Duration> {
    res.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl SourceAdapter for HttpJsonAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn list_page(&self, page: u32) -> Result<ListingPage, SourceError> {
        if page == 1 && self.respect_robots {
            self.check_robots().await?;
        }
        let url = self.page_url(page);
        debug!(source = %self.source_id, %url, "fetching page");
        let res = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| SourceError::Fetch(e.to_string()))?;

        if let Some(err) = classify_status(res.status(), retry_after(&res)) {
            return Err(err);
        }

        let body: Value = res
            .json()
            .await
            .map_err(|e| SourceError::Parse(format!("invalid JSON body: {}", e)))?;
        parse_page_body(&body)
    }

    fn parse(&self, raw: &RawListing) -> Result<CandidateFields, SourceError> {
        self.fields.extract(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LISTINGS: &str = r#"{"listings": [{"id": "1", "title": "Nhà phố"}], "has_more": true}"#;

    /// Serves `(path, status, body)` routes over plain HTTP and records every
    /// request target it sees.
    async fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let head = String::from_utf8_lossy(&buf).to_string();
                let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                log.lock().unwrap().push(target.clone());
                let path = target.split('?').next().unwrap();
                let (status, body) = routes
                    .iter()
                    .find(|(p, _, _)| *p == path)
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, ""));
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn adapter_for(origin: &str) -> HttpJsonAdapter {
        HttpJsonAdapter::new(
            "bds",
            &format!("{}/api/listings", origin),
            "page",
            FieldMap::default(),
            5,
        )
        .unwrap()
    }

    #[test]
    fn robots_group_selection_and_precedence() {
        let robots = "\
# comment
User-agent: *
Disallow: /api/
Allow: /api/public

User-agent: Googlebot
User-agent: listing-watchbot
Disallow: /private
";
        // the named group replaces the * group entirely
        assert!(robots_allows(robots, ROBOT_NAME, "/api/listings?page=1"));
        assert!(!robots_allows(robots, ROBOT_NAME, "/private/x"));

        assert!(!robots_allows(robots, "otherbot", "/api/listings?page=1"));
        assert!(robots_allows(robots, "otherbot", "/api/public/listings"));
        assert!(robots_allows(robots, "otherbot", "/"));
    }

    #[test]
    fn robots_edge_cases() {
        assert!(robots_allows("", ROBOT_NAME, "/anything"));
        assert!(robots_allows("User-agent: *\nDisallow:\n", ROBOT_NAME, "/api"));
        assert!(!robots_allows("User-agent: *\nDisallow: /\n", ROBOT_NAME, "/api"));
        // equal length: Allow wins
        assert!(robots_allows(
            "User-agent: *\nDisallow: /api\nAllow: /api\n",
            ROBOT_NAME,
            "/api/x"
        ));
        // wildcards and anchors
        let robots = "User-agent: *\nDisallow: /*.json$\nDisallow: /search*page=\n";
        assert!(!robots_allows(robots, ROBOT_NAME, "/feed/a.json"));
        assert!(robots_allows(robots, ROBOT_NAME, "/feed/a.json?x=1"));
        assert!(!robots_allows(robots, ROBOT_NAME, "/search?q=1&page=2"));
        assert!(robots_allows(robots, ROBOT_NAME, "/searching"));
    }

    #[tokio::test]
    async fn disallowed_source_sends_no_page_request() {
        let (origin, seen) = serve(vec![(
            "/robots.txt",
            200,
            "User-agent: *\nDisallow: /api/\n",
        )])
        .await;
        let err = adapter_for(&origin).list_page(1).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert!(!err.is_retryable());
        assert_eq!(*seen.lock().unwrap(), vec!["/robots.txt".to_string()]);
    }

    #[tokio::test]
    async fn missing_robots_allows_scraping() {
        let (origin, seen) = serve(vec![("/api/listings", 200, LISTINGS)]).await;
        let adapter = adapter_for(&origin);
        let page = adapter.list_page(1).await.unwrap();
        assert_eq!(page.listings.len(), 1);
        // robots.txt is only consulted before the first page
        adapter.list_page(2).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "/robots.txt".to_string(),
                "/api/listings?page=1".to_string(),
                "/api/listings?page=2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn robots_check_can_be_turned_off() {
        let (origin, seen) = serve(vec![
            ("/robots.txt", 200, "User-agent: *\nDisallow: /\n"),
            ("/api/listings", 200, LISTINGS),
        ])
        .await;
        let adapter = adapter_for(&origin).respect_robots(false);
        assert_eq!(adapter.list_page(1).await.unwrap().listings.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["/api/listings?page=1".to_string()]);
    }

    #[test]
    fn page_url_appends_param() {
        let adapter = HttpJsonAdapter::new(
            "bds",
            "https://example.com/api/listings?city=hcm",
            "p",
            FieldMap::default(),
            5,
        )
        .unwrap();
        assert_eq!(
            adapter.page_url(3).as_str(),
            "https://example.com/api/listings?city=hcm&p=3"
        );
        assert_eq!(adapter.max_pages(), 5);
    }

    #[test]
    fn invalid_url_rejected() {
        assert!(HttpJsonAdapter::new("x", "not a url", "page", FieldMap::default(), 1).is_err());
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK, None), None);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(9))),
            Some(SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(9))
            })
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(SourceError::Server { status: 502 })
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(SourceError::Client { status: 404 })
        );
    }
}
