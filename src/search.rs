//!
//! Cache-aware bidirectional path search
//! -------------------------------------
//! Given two resolved article titles, find up to K short, diverse paths by
//! growing a forward frontier from the start (outgoing links) and a backward
//! frontier from the end (back-links), always expanding the smaller side one
//! layer at a time. Frontier intersections become candidate paths which the
//! diversity collector accepts or rejects; accepted paths stream out as
//! events and are written back into the segment cache on completion.
//!
//! Before any network traffic the engine consults the cache; a cached path
//! is only replayed after every one of its edges revalidates against the
//! live graph.

pub mod diversity;
pub mod frontier;
pub mod merge;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::SegmentCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::events::{Event, EventSink, SearchStats};
use crate::search::diversity::PathCollector;
use crate::search::frontier::Frontier;
use crate::search::merge::merge_paths;
use crate::storage::{SearchRecord, SharedStore};
use crate::title::Title;
use crate::upstream::{LinkDirection, LinkSource};

pub const MAX_PATHS_LIMIT: usize = 5;
pub const DEFAULT_MAX_PATHS: usize = 1;
pub const DEFAULT_MIN_DIVERSITY: f64 = 0.3;

fn default_max_paths() -> usize {
    DEFAULT_MAX_PATHS
}

fn default_min_diversity() -> f64 {
    DEFAULT_MIN_DIVERSITY
}

/// Incoming search request, also the JSON payload of `/find-path-stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub start: String,
    pub end: String,
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
    #[serde(default = "default_min_diversity")]
    pub min_diversity: f64,
}

struct Params {
    start: Title,
    end: Title,
    max_paths: usize,
    min_diversity: f64,
}

fn validate_request(req: &SearchRequest) -> AppResult<Params> {
    if !(1..=MAX_PATHS_LIMIT).contains(&req.max_paths) {
        return Err(AppError::invalid_input(format!(
            "max_paths must be between 1 and {}",
            MAX_PATHS_LIMIT
        )));
    }
    if !(0.0..=1.0).contains(&req.min_diversity) {
        return Err(AppError::invalid_input("min_diversity must be between 0.0 and 1.0"));
    }
    let start = Title::normalize(&req.start)?;
    let end = Title::normalize(&req.end)?;
    Ok(Params { start, end, max_paths: req.max_paths, min_diversity: req.min_diversity })
}

/// A frontier intersection found while expanding one layer.
struct Meeting {
    /// Title in the frontier being expanded (parent of the discovery).
    this_title: Title,
    /// The discovered neighbor, already present in the opposite frontier.
    other_title: Title,
    total_hops: u32,
}

impl Meeting {
    fn meeting_point(&self) -> &Title {
        &self.other_title
    }
}

/// Join the forward walk to the meeting with the backward walk from it.
/// Returns None when the two halves share a title (the path would loop).
fn reconstruct(fwd: &Frontier, bwd: &Frontier, m: &Meeting, expanded_forward: bool) -> Option<Vec<Title>> {
    let (f_anchor, b_anchor) = if expanded_forward {
        (&m.this_title, &m.other_title)
    } else {
        (&m.other_title, &m.this_title)
    };
    let mut path = fwd.path_from_root(f_anchor);
    let back = bwd.path_from_root(b_anchor);
    if path.is_empty() || back.is_empty() {
        return None;
    }
    path.extend(back.into_iter().rev());
    let unique: HashSet<&Title> = path.iter().collect();
    if unique.len() != path.len() {
        return None;
    }
    Some(path)
}

pub struct SearchEngine {
    source: Arc<dyn LinkSource>,
    cache: Arc<SegmentCache>,
    store: SharedStore,
    config: Arc<Config>,
}

impl SearchEngine {
    pub fn new(
        source: Arc<dyn LinkSource>,
        cache: Arc<SegmentCache>,
        store: SharedStore,
        config: Arc<Config>,
    ) -> Self {
        Self { source, cache, store, config }
    }

    /// Drive one search to completion, emitting events into `sink`. The
    /// subscriber disappearing cancels the search at the next layer boundary
    /// and nothing is persisted for it.
    pub async fn run(&self, req: SearchRequest, sink: EventSink) {
        let started = Instant::now();
        let params = match validate_request(&req) {
            Ok(p) => p,
            Err(e) => {
                sink.send(Event::error(&e)).await;
                return;
            }
        };
        let Params { start, end, max_paths, min_diversity } = params;
        let announced = Event::Start {
            start: req.start.clone(),
            end: req.end.clone(),
            max_paths,
            min_diversity,
        };
        if !sink.send(announced).await {
            return;
        }

        // Identical endpoints short-circuit before any upstream traffic.
        if start == end {
            self.finish_single(&req, start, started, &sink).await;
            return;
        }

        let resolving = Event::Resolving {
            message: format!("Resolving '{}' and '{}'", start, end),
        };
        if !sink.send(resolving).await {
            return;
        }
        let (rs, re) = tokio::join!(self.source.resolve(&start), self.source.resolve(&end));
        let (start, end) = match (rs, re) {
            (Ok(s), Ok(e)) => (s, e),
            (Err(e), _) | (_, Err(e)) => {
                self.persist(&req, None, false, 0, started, &[]);
                sink.send(Event::error(&e)).await;
                return;
            }
        };
        if !sink.send(Event::Resolved { start: start.clone(), end: end.clone() }).await {
            return;
        }
        if start == end {
            self.finish_single(&req, start, started, &sink).await;
            return;
        }

        let mut collector = PathCollector::new(max_paths, min_diversity);
        let mut pages_checked: u64 = 0;

        // Cache-first: replay a cached path only after all of its edges
        // revalidate in one concurrent batch.
        if let Some(titles) = self.cache.lookup(&start, &end) {
            match self.revalidate(&titles, &mut pages_checked).await {
                Ok(true) => {
                    let meeting = titles[titles.len() / 2].clone();
                    if let Some(idx) = collector.offer(titles.clone(), meeting.clone()) {
                        let ev = Event::PathFound {
                            length: titles.len() - 1,
                            path: titles,
                            meeting_point: meeting,
                            index: idx,
                        };
                        if !sink.send(ev).await {
                            return;
                        }
                    }
                }
                Ok(false) => {
                    self.cache.invalidate(&start, &end);
                }
                Err(e) => {
                    // Treat like a miss; BFS will surface upstream trouble
                    // if it persists.
                    warn!(target: "wikipath::search", "cache revalidation failed: {}", e);
                }
            }
        }
        if collector.is_full() {
            self.finish_success(&req, &start, &end, &collector, pages_checked, started, false, &sink).await;
            return;
        }

        let mut fwd = Frontier::new(start.clone());
        let mut bwd = Frontier::new(end.clone());
        let mut shortest: Option<usize> = collector.shortest_hops();
        let slack = self.config.diversity_slack as usize;
        let resolved = Some((&start, &end));

        loop {
            if sink.is_closed() {
                debug!(target: "wikipath::search", "subscriber disconnected, abandoning search");
                return;
            }
            if started.elapsed() >= self.config.request_timeout() {
                if collector.is_empty() {
                    let err = AppError::timed_out(format!(
                        "no path found within {}s",
                        self.config.request_timeout_s
                    ));
                    self.persist(&req, resolved, false, pages_checked, started, &[]);
                    sink.send(Event::error(&err)).await;
                } else {
                    self.finish_success(&req, &start, &end, &collector, pages_checked, started, true, &sink).await;
                }
                return;
            }
            if pages_checked >= self.config.pages_checked_ceiling {
                if collector.is_empty() {
                    let err = AppError::no_path(format!(
                        "no path found after checking {} pages",
                        pages_checked
                    ));
                    self.persist(&req, resolved, false, pages_checked, started, &[]);
                    sink.send(Event::error(&err)).await;
                } else {
                    self.finish_success(&req, &start, &end, &collector, pages_checked, started, true, &sink).await;
                }
                return;
            }
            // Hop count of any path the next expansion could complete.
            let next_total = (fwd.depth() + bwd.depth() + 1) as usize;
            let depth_exhausted = next_total > self.config.max_depth as usize
                || shortest.map(|s| next_total > s + slack).unwrap_or(false)
                || (fwd.layer().is_empty() && bwd.layer().is_empty());
            if depth_exhausted {
                if collector.is_empty() {
                    let err = AppError::no_path(format!(
                        "no path between '{}' and '{}' within {} hops",
                        start, end, self.config.max_depth
                    ));
                    self.persist(&req, resolved, false, pages_checked, started, &[]);
                    sink.send(Event::error(&err)).await;
                } else {
                    self.finish_success(&req, &start, &end, &collector, pages_checked, started, false, &sink).await;
                }
                return;
            }

            let expand_forward = if fwd.layer().is_empty() {
                false
            } else if bwd.layer().is_empty() {
                true
            } else {
                fwd.layer().len() <= bwd.layer().len()
            };
            let layer_result = if expand_forward {
                self.expand_layer(&mut fwd, &bwd, LinkDirection::Forward, &mut pages_checked).await
            } else {
                self.expand_layer(&mut bwd, &fwd, LinkDirection::Backward, &mut pages_checked).await
            };
            let mut meetings = match layer_result {
                Ok(m) => m,
                Err(e) => {
                    if collector.is_empty() {
                        self.persist(&req, resolved, false, pages_checked, started, &[]);
                        sink.send(Event::error(&e)).await;
                    } else {
                        warn!(target: "wikipath::search", "upstream failed mid-search, returning partial results: {}", e);
                        self.finish_success(&req, &start, &end, &collector, pages_checked, started, true, &sink).await;
                    }
                    return;
                }
            };

            // Shortest candidates first; ties break on the meeting title so
            // results are deterministic for a fixed graph.
            meetings.sort_by(|a, b| {
                a.total_hops
                    .cmp(&b.total_hops)
                    .then_with(|| a.other_title.cmp(&b.other_title))
                    .then_with(|| a.this_title.cmp(&b.this_title))
            });
            for m in meetings {
                if collector.is_full() {
                    break;
                }
                let Some(path) = reconstruct(&fwd, &bwd, &m, expand_forward) else { continue };
                if shortest.is_none() {
                    shortest = Some(path.len() - 1);
                }
                let meeting = m.meeting_point().clone();
                if let Some(idx) = collector.offer(path.clone(), meeting.clone()) {
                    let ev = Event::PathFound {
                        length: path.len() - 1,
                        path,
                        meeting_point: meeting,
                        index: idx,
                    };
                    if !sink.send(ev).await {
                        return;
                    }
                }
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let pages_per_second = if elapsed_ms == 0 {
                pages_checked as f64
            } else {
                pages_checked as f64 * 1000.0 / elapsed_ms as f64
            };
            let progressed = sink.send_progress(Event::Progress {
                forward_depth: fwd.depth(),
                backward_depth: bwd.depth(),
                pages_checked,
                pages_per_second,
                elapsed_ms,
            });
            if !progressed {
                return;
            }
            if collector.is_full() {
                self.finish_success(&req, &start, &end, &collector, pages_checked, started, false, &sink).await;
                return;
            }
        }
    }

    /// Expand `this` by one BFS layer, fetching every layer title's links in
    /// parallel under the upstream concurrency cap. Vanished articles and
    /// malformed payloads count as dead ends; only availability failures
    /// abort the layer.
    async fn expand_layer(
        &self,
        this: &mut Frontier,
        other: &Frontier,
        dir: LinkDirection,
        pages_checked: &mut u64,
    ) -> AppResult<Vec<Meeting>> {
        let layer: Vec<Title> = this.layer().to_vec();
        let mut results: Vec<(Title, AppResult<std::collections::BTreeSet<Title>>)> =
            futures_util::stream::iter(layer.into_iter().map(|t| {
                let source = self.source.clone();
                async move {
                    let links = source.links(&t, dir).await;
                    (t, links)
                }
            }))
            .buffer_unordered(self.config.upstream_concurrency_cap.max(1))
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        *pages_checked += results.len() as u64;

        let mut next_layer = Vec::new();
        let mut meetings = Vec::new();
        for (u, res) in results {
            let neighbors = match res {
                Ok(set) => set,
                Err(AppError::TitleUnknown { .. }) => {
                    debug!(target: "wikipath::search", "'{}' vanished mid-search, treating as dead end", u);
                    continue;
                }
                Err(e @ AppError::UpstreamUnavailable { .. }) => return Err(e),
                Err(e) => {
                    warn!(target: "wikipath::search", "fetch for '{}' failed: {}", u, e);
                    continue;
                }
            };
            let u_depth = this.depth_of(&u).unwrap_or_else(|| this.depth());
            for v in neighbors {
                if this.contains(&v) {
                    continue;
                }
                if let Some(v_depth) = other.depth_of(&v) {
                    meetings.push(Meeting {
                        this_title: u.clone(),
                        other_title: v.clone(),
                        total_hops: u_depth + v_depth + 1,
                    });
                }
                if this.insert(v.clone(), u.clone()) {
                    next_layer.push(v);
                }
            }
        }
        this.advance(next_layer);
        Ok(meetings)
    }

    /// Confirm every edge of a cached path in one concurrent batch of
    /// forward-link fetches.
    async fn revalidate(&self, titles: &[Title], pages_checked: &mut u64) -> AppResult<bool> {
        if titles.len() < 2 {
            return Ok(false);
        }
        let pairs: Vec<(Title, Title)> =
            titles.windows(2).map(|pair| (pair[0].clone(), pair[1].clone())).collect();
        let checks: Vec<AppResult<bool>> = futures_util::stream::iter(pairs.into_iter().map(|(u, v)| {
            let source = self.source.clone();
            async move {
                let links = source.links(&u, LinkDirection::Forward).await?;
                Ok(links.contains(&v))
            }
        }))
        .buffer_unordered(self.config.upstream_concurrency_cap.max(1))
        .collect()
        .await;
        *pages_checked += (titles.len() - 1) as u64;
        for check in checks {
            match check {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(AppError::TitleUnknown { .. }) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// start == end: a single-element path with zero hops and no fetches.
    async fn finish_single(&self, req: &SearchRequest, title: Title, started: Instant, sink: &EventSink) {
        let ev = Event::PathFound {
            path: vec![title.clone()],
            meeting_point: title.clone(),
            length: 0,
            index: 0,
        };
        if !sink.send(ev).await {
            return;
        }
        let paths = vec![vec![title.clone()]];
        let record_id = self.persist(req, Some((&title, &title)), true, 0, started, &paths);
        let graph = merge_paths(&paths);
        let stats = SearchStats {
            record_id,
            pages_checked: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
            partial: false,
        };
        sink.send(Event::Complete { paths, graph, stats }).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_success(
        &self,
        req: &SearchRequest,
        start: &Title,
        end: &Title,
        collector: &PathCollector,
        pages_checked: u64,
        started: Instant,
        partial: bool,
        sink: &EventSink,
    ) {
        let paths: Vec<Vec<Title>> = collector.paths().iter().map(|p| p.titles.clone()).collect();
        for p in &paths {
            self.cache.insert(p);
        }
        let graph = merge_paths(&paths);
        let record_id = self.persist(req, Some((start, end)), true, pages_checked, started, &paths);
        let stats = SearchStats {
            record_id,
            pages_checked,
            elapsed_ms: started.elapsed().as_millis() as u64,
            partial,
        };
        sink.send(Event::Complete { paths, graph, stats }).await;
    }

    fn persist(
        &self,
        req: &SearchRequest,
        resolved: Option<(&Title, &Title)>,
        success: bool,
        pages_checked: u64,
        started: Instant,
        paths: &[Vec<Title>],
    ) -> Option<i64> {
        let rec = SearchRecord {
            id: 0,
            start: req.start.clone(),
            end: req.end.clone(),
            resolved_start: resolved.map(|(s, _)| s.as_str().to_string()),
            resolved_end: resolved.map(|(_, e)| e.as_str().to_string()),
            success,
            pages_checked,
            elapsed_ms: started.elapsed().as_millis() as u64,
            paths: paths.to_vec(),
            created_at: Utc::now().to_rfc3339(),
        };
        match self.store.0.lock().append_record(rec) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(target: "wikipath::search", "failed to persist search record: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(s: &str) -> Title {
        Title::normalize(s).expect("title")
    }

    #[test]
    fn request_validation_ranges() {
        let ok = SearchRequest {
            start: "A".into(),
            end: "B".into(),
            max_paths: 3,
            min_diversity: 0.5,
        };
        assert!(validate_request(&ok).is_ok());

        let mut bad = ok.clone();
        bad.max_paths = 0;
        assert!(validate_request(&bad).is_err());
        bad.max_paths = 6;
        assert!(validate_request(&bad).is_err());

        let mut bad = ok.clone();
        bad.min_diversity = 1.5;
        assert!(validate_request(&bad).is_err());

        let mut bad = ok;
        bad.start = "".into();
        assert!(validate_request(&bad).is_err());
    }

    #[test]
    fn reconstruct_rejects_looping_paths() {
        // Forward: A -> B; backward walk from the meeting also contains B.
        let mut fwd = Frontier::new(title("A"));
        fwd.insert(title("B"), title("A"));
        fwd.advance(vec![title("B")]);
        let mut bwd = Frontier::new(title("E"));
        bwd.insert(title("B"), title("E"));
        bwd.advance(vec![title("B")]);
        bwd.insert(title("C"), title("B"));
        bwd.advance(vec![title("C")]);
        let m = Meeting {
            this_title: title("B"),
            other_title: title("C"),
            total_hops: 3,
        };
        assert!(reconstruct(&fwd, &bwd, &m, true).is_none());
    }

    #[test]
    fn reconstruct_joins_both_walks() {
        let mut fwd = Frontier::new(title("A"));
        fwd.insert(title("B"), title("A"));
        fwd.advance(vec![title("B")]);
        let mut bwd = Frontier::new(title("D"));
        bwd.insert(title("C"), title("D"));
        bwd.advance(vec![title("C")]);
        let m = Meeting {
            this_title: title("B"),
            other_title: title("C"),
            total_hops: 3,
        };
        let path = reconstruct(&fwd, &bwd, &m, true).expect("path");
        assert_eq!(path, vec![title("A"), title("B"), title("C"), title("D")]);
    }
}
