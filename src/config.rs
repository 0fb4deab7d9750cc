//!
//! Runtime configuration
//! ---------------------
//! All tunables are read once at startup from `WIKIPATH_*` environment
//! variables with sensible defaults, then threaded through the server state.

use std::str::FromStr;
use std::time::Duration;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub http_port: u16,
    /// Root folder for search records and the durable segment tier.
    pub data_dir: String,
    /// MediaWiki action API endpoint.
    pub api_base: String,
    /// Maximum total path length (hops) the search will consider.
    pub max_depth: u32,
    /// Concurrent outstanding upstream requests.
    pub upstream_concurrency_cap: usize,
    /// Neighbors retained per title before pagination stops.
    pub per_title_neighbor_cap: usize,
    /// In-memory LRU capacity of the segment cache.
    pub cache_capacity: usize,
    /// Durable segments unused for this many days are compacted away.
    pub cache_ttl_days: i64,
    /// Per-request wall-clock cap in seconds.
    pub request_timeout_s: u64,
    /// Per-fetch timeout in seconds, fed into the retry policy.
    pub fetch_timeout_s: u64,
    /// Hard ceiling on pages fetched for one search.
    pub pages_checked_ceiling: u64,
    /// Extra hops past the shortest path the search keeps exploring.
    pub diversity_slack: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_dir: "data".to_string(),
            api_base: "https://en.wikipedia.org/w/api.php".to_string(),
            max_depth: 6,
            upstream_concurrency_cap: 50,
            per_title_neighbor_cap: 500,
            cache_capacity: 10_000,
            cache_ttl_days: 30,
            request_timeout_s: 60,
            fetch_timeout_s: 10,
            pages_checked_ceiling: 50_000,
            diversity_slack: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            http_port: env_parse("WIKIPATH_HTTP_PORT", d.http_port),
            data_dir: env_string("WIKIPATH_DATA_DIR", &d.data_dir),
            api_base: env_string("WIKIPATH_API_BASE", &d.api_base),
            max_depth: env_parse("WIKIPATH_MAX_DEPTH", d.max_depth),
            upstream_concurrency_cap: env_parse("WIKIPATH_UPSTREAM_CONCURRENCY", d.upstream_concurrency_cap),
            per_title_neighbor_cap: env_parse("WIKIPATH_NEIGHBOR_CAP", d.per_title_neighbor_cap),
            cache_capacity: env_parse("WIKIPATH_CACHE_CAPACITY", d.cache_capacity),
            cache_ttl_days: env_parse("WIKIPATH_CACHE_TTL_DAYS", d.cache_ttl_days),
            request_timeout_s: env_parse("WIKIPATH_REQUEST_TIMEOUT_S", d.request_timeout_s),
            fetch_timeout_s: env_parse("WIKIPATH_FETCH_TIMEOUT_S", d.fetch_timeout_s),
            pages_checked_ceiling: env_parse("WIKIPATH_PAGES_CEILING", d.pages_checked_ceiling),
            diversity_slack: env_parse("WIKIPATH_DIVERSITY_SLACK", d.diversity_slack),
        }
    }

    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_s) }
    pub fn fetch_timeout(&self) -> Duration { Duration::from_secs(self.fetch_timeout_s) }
}
