//!
//! Upstream link client
//! --------------------
//! Fetches outgoing links, back-links, redirect-resolved titles and
//! autocomplete suggestions from the MediaWiki action API. All payloads are
//! treated as untrusted: titles are sanitized at this boundary and malformed
//! documents degrade to "no neighbors" rather than failing a search.
//!
//! A semaphore caps concurrent outstanding requests; transient failures are
//! retried with exponential backoff and jitter before surfacing as
//! `UpstreamUnavailable`.

use futures_util::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::title::Title;

const RETRY_ATTEMPTS: u32 = 4;
const RETRY_BASE_MS: u64 = 500;
const RETRY_JITTER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Outgoing links of an article.
    Forward,
    /// Articles linking to it.
    Backward,
}

/// The seam the search engine consumes; tests substitute a fixed in-memory
/// graph, production uses [`WikiClient`].
pub trait LinkSource: Send + Sync {
    /// Resolve a title to its canonical form, following redirects.
    fn resolve<'a>(&'a self, title: &'a Title) -> BoxFuture<'a, AppResult<Title>>;

    /// Fetch the neighbor set of a title in the given direction.
    fn links<'a>(&'a self, title: &'a Title, dir: LinkDirection) -> BoxFuture<'a, AppResult<BTreeSet<Title>>>;
}

/// Leaf failure of a single API round trip, classified for retry.
#[derive(Debug, Error)]
enum FetchError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("no such article")]
    Missing,
    #[error("client shut down")]
    Closed,
}

impl FetchError {
    fn retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::Missing | FetchError::Closed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStats {
    pub requests: u64,
    pub retries: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

pub struct WikiClient {
    http: reqwest::Client,
    api_base: String,
    permits: Semaphore,
    neighbor_cap: usize,
    counters: Counters,
}

impl WikiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent(concat!("wikipath/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            permits: Semaphore::new(config.upstream_concurrency_cap.max(1)),
            neighbor_cap: config.per_title_neighbor_cap,
            counters: Counters::default(),
        })
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// One API round trip under the concurrency cap.
    async fn api_get(&self, params: &[(String, String)]) -> Result<Value, FetchError> {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let resp = self.http.get(&self.api_base).query(params).send().await?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(FetchError::Missing);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(resp.json::<Value>().await?)
    }

    /// Round trip with bounded retry: exponential backoff from 0.5s, factor
    /// 2, up to 4 attempts, jitter ±20%.
    async fn api_get_retrying(&self, params: &[(String, String)]) -> AppResult<Value> {
        let mut attempt: u32 = 0;
        loop {
            match self.api_get(params).await {
                Ok(v) => return Ok(v),
                Err(FetchError::Missing) => {
                    return Err(AppError::title_unknown("no such article"));
                }
                Err(e) if e.retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let backoff = RETRY_BASE_MS * 2u64.pow(attempt - 1);
                    let jitter: f64 = rand::thread_rng().gen_range((1.0 - RETRY_JITTER)..=(1.0 + RETRY_JITTER));
                    let delay = Duration::from_millis((backoff as f64 * jitter) as u64);
                    debug!(target: "wikipath::upstream", "retrying after {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(AppError::upstream_unavailable(e.to_string()));
                }
            }
        }
    }

    pub async fn resolve_title(&self, title: &Title) -> AppResult<Title> {
        let params = vec![
            ("action".to_string(), "query".to_string()),
            ("format".to_string(), "json".to_string()),
            ("formatversion".to_string(), "2".to_string()),
            ("redirects".to_string(), "1".to_string()),
            ("titles".to_string(), title.as_str().to_string()),
        ];
        let doc = self.api_get_retrying(&params).await?;
        let page = doc
            .get("query")
            .and_then(|q| q.get("pages"))
            .and_then(|p| p.get(0));
        let Some(page) = page else {
            return Err(AppError::title_unknown(format!("no article named '{}'", title)));
        };
        if page.get("missing").map(|m| m != &Value::Bool(false)).unwrap_or(false)
            || page.get("invalid").is_some()
        {
            return Err(AppError::title_unknown(format!("no article named '{}'", title)));
        }
        match page.get("title").and_then(|t| t.as_str()) {
            Some(canonical) => Title::normalize(canonical),
            None => Err(AppError::title_unknown(format!("no article named '{}'", title))),
        }
    }

    pub async fn fetch_links(&self, title: &Title, dir: LinkDirection) -> AppResult<BTreeSet<Title>> {
        let mut out = BTreeSet::new();
        let mut continuation: Option<(String, String)> = None;
        loop {
            let mut params = vec![
                ("action".to_string(), "query".to_string()),
                ("format".to_string(), "json".to_string()),
                ("formatversion".to_string(), "2".to_string()),
            ];
            match dir {
                LinkDirection::Forward => {
                    params.push(("titles".to_string(), title.as_str().to_string()));
                    params.push(("prop".to_string(), "links".to_string()));
                    params.push(("pllimit".to_string(), "max".to_string()));
                    params.push(("plnamespace".to_string(), "0".to_string()));
                }
                LinkDirection::Backward => {
                    params.push(("list".to_string(), "backlinks".to_string()));
                    params.push(("bltitle".to_string(), title.as_str().to_string()));
                    params.push(("bllimit".to_string(), "max".to_string()));
                    params.push(("blnamespace".to_string(), "0".to_string()));
                }
            }
            if let Some((k, v)) = &continuation {
                params.push((k.clone(), v.clone()));
            }
            let doc = self.api_get_retrying(&params).await?;
            continuation = absorb_links(&doc, dir, title, self.neighbor_cap, &mut out);
            if continuation.is_none() || out.len() >= self.neighbor_cap {
                break;
            }
        }
        Ok(out)
    }

    /// Prefix suggestions from the opensearch endpoint.
    pub async fn autocomplete(&self, prefix: &str, limit: usize) -> AppResult<Vec<String>> {
        let params = vec![
            ("action".to_string(), "opensearch".to_string()),
            ("format".to_string(), "json".to_string()),
            ("namespace".to_string(), "0".to_string()),
            ("limit".to_string(), limit.to_string()),
            ("search".to_string(), prefix.to_string()),
        ];
        let doc = self.api_get_retrying(&params).await?;
        let titles = doc
            .get(1)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(titles)
    }
}

impl LinkSource for WikiClient {
    fn resolve<'a>(&'a self, title: &'a Title) -> BoxFuture<'a, AppResult<Title>> {
        Box::pin(self.resolve_title(title))
    }

    fn links<'a>(&'a self, title: &'a Title, dir: LinkDirection) -> BoxFuture<'a, AppResult<BTreeSet<Title>>> {
        Box::pin(self.fetch_links(title, dir))
    }
}

/// Pull sanitized neighbor titles out of one API response page, up to `cap`
/// entries. Returns the continuation token pair when the upstream has more.
/// Anything structurally unexpected is logged and treated as no neighbors.
fn absorb_links(
    doc: &Value,
    dir: LinkDirection,
    own: &Title,
    cap: usize,
    out: &mut BTreeSet<Title>,
) -> Option<(String, String)> {
    let entries = match dir {
        LinkDirection::Forward => doc
            .get("query")
            .and_then(|q| q.get("pages"))
            .and_then(|p| p.get(0))
            .and_then(|page| page.get("links"))
            .and_then(|l| l.as_array()),
        LinkDirection::Backward => doc
            .get("query")
            .and_then(|q| q.get("backlinks"))
            .and_then(|l| l.as_array()),
    };
    let Some(entries) = entries else {
        if doc.get("query").is_none() {
            warn!(target: "wikipath::upstream", "malformed upstream payload for '{}', treating as no neighbors", own);
        }
        return None;
    };
    for entry in entries {
        if out.len() >= cap {
            return None;
        }
        // Namespace is filtered server-side too; skip anything non-article.
        if entry.get("ns").and_then(|n| n.as_i64()).unwrap_or(0) != 0 {
            continue;
        }
        let Some(raw) = entry.get("title").and_then(|t| t.as_str()) else { continue };
        match Title::normalize(raw) {
            Ok(t) if &t == own => {}
            Ok(t) => {
                out.insert(t);
            }
            Err(_) => {
                debug!(target: "wikipath::upstream", "dropping unnormalizable upstream title {:?}", raw);
            }
        }
    }
    let cont_key = match dir {
        LinkDirection::Forward => "plcontinue",
        LinkDirection::Backward => "blcontinue",
    };
    doc.get("continue")
        .and_then(|c| c.get(cont_key))
        .and_then(|v| v.as_str())
        .map(|v| (cont_key.to_string(), v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn title(s: &str) -> Title {
        Title::normalize(s).expect("title")
    }

    #[test]
    fn absorbs_forward_links_and_continuation() {
        let doc = json!({
            "query": { "pages": [ { "title": "Graph theory", "links": [
                { "ns": 0, "title": "Leonhard Euler" },
                { "ns": 0, "title": "Graph theory" },
                { "ns": 14, "title": "Category:Mathematics" },
                { "ns": 0, "title": "Seven Bridges of Königsberg" }
            ] } ] },
            "continue": { "plcontinue": "1234|0|Next", "continue": "||" }
        });
        let mut out = BTreeSet::new();
        let own = title("Graph theory");
        let cont = absorb_links(&doc, LinkDirection::Forward, &own, 500, &mut out);
        assert_eq!(cont, Some(("plcontinue".to_string(), "1234|0|Next".to_string())));
        assert_eq!(out.len(), 2, "self-loop and non-article namespace excluded");
        assert!(out.contains(&title("Leonhard Euler")));
        assert!(out.contains(&title("Seven Bridges of Königsberg")));
    }

    #[test]
    fn absorbs_backlinks() {
        let doc = json!({
            "query": { "backlinks": [
                { "ns": 0, "title": "Mathematics" },
                { "ns": 1, "title": "Talk:Mathematics" }
            ] }
        });
        let mut out = BTreeSet::new();
        let own = title("Graph theory");
        let cont = absorb_links(&doc, LinkDirection::Backward, &own, 500, &mut out);
        assert!(cont.is_none());
        assert_eq!(out.len(), 1);
        assert!(out.contains(&title("Mathematics")));
    }

    #[test]
    fn malformed_payload_is_empty_not_fatal() {
        let doc = json!({ "error": { "code": "maxlag" } });
        let mut out = BTreeSet::new();
        let own = title("Anything");
        assert!(absorb_links(&doc, LinkDirection::Forward, &own, 500, &mut out).is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn neighbor_cap_stops_pagination() {
        let links: Vec<Value> = (0..20)
            .map(|i| json!({ "ns": 0, "title": format!("Page {}", i) }))
            .collect();
        let doc = json!({
            "query": { "pages": [ { "title": "Hub", "links": links } ] },
            "continue": { "plcontinue": "more" }
        });
        let mut out = BTreeSet::new();
        let own = title("Hub");
        let cont = absorb_links(&doc, LinkDirection::Forward, &own, 10, &mut out);
        assert!(cont.is_none(), "cap reached, continuation discarded");
        assert_eq!(out.len(), 10);
    }
}
