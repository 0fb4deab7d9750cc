//!
//! Two-tier segment cache
//! ----------------------
//! In-memory LRU over (start, end) → path segment, backed by the durable
//! tier in the store. Lookups consult memory first and promote durable hits;
//! inserts fan a path out into all bounded sub-segments and enqueue durable
//! upserts which a background flusher drains in batches. One mutex guards
//! the whole in-memory state so insertions are linearizable with lookups.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::debug;

use crate::storage::{SegKey, Segment, SharedStore};
use crate::title::Title;

/// Longest sub-path (in titles) stored per segment; bounds the O(n²) blowup
/// of enumerating every contiguous sub-sequence of a long path.
pub const MAX_SEGMENT_TITLES: usize = 10;

/// Pending durable writes that force an immediate flush.
pub const FLUSH_MAX_PENDING: usize = 256;

/// Flush cadence for the background writer.
pub const FLUSH_INTERVAL_MS: u64 = 500;

/// Enumerate every contiguous sub-sequence of `path` with at least two and
/// at most [`MAX_SEGMENT_TITLES`] titles.
pub fn extract_segments(path: &[Title]) -> Vec<Vec<Title>> {
    let n = path.len();
    let mut out = Vec::new();
    if n < 2 {
        return out;
    }
    let widest = MAX_SEGMENT_TITLES.min(n);
    for width in 2..=widest {
        for window in path.windows(width) {
            out.push(window.to_vec());
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct LruEntry {
    segment: Segment,
    tick: u64,
}

struct CacheInner {
    capacity: usize,
    entries: HashMap<SegKey, LruEntry>,
    /// Access order index: tick → key, smallest tick is coldest.
    order: BTreeMap<u64, SegKey>,
    tick: u64,
    /// Durable upserts queued for the flusher, deduplicated by key.
    pending: HashMap<SegKey, Segment>,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &SegKey) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    /// Insert at MRU position, applying the no-longer-path replacement rule.
    /// Evictions overflow into `pending` so the durable tier keeps them.
    fn insert(&mut self, segment: Segment, spill_evicted: bool) {
        let key = segment.key();
        if let Some(existing) = self.entries.get(&key) {
            if existing.segment.hops() < segment.hops() {
                return;
            }
        }
        let tick = self.next_tick();
        if let Some(old) = self.entries.insert(key.clone(), LruEntry { segment, tick }) {
            self.order.remove(&old.tick);
        }
        self.order.insert(tick, key);
        while self.entries.len() > self.capacity {
            let Some((&coldest, _)) = self.order.iter().next() else { break };
            if let Some(victim) = self.order.remove(&coldest).and_then(|k| self.entries.remove(&k)) {
                if spill_evicted {
                    self.pending.insert(victim.segment.key(), victim.segment);
                }
            }
        }
    }

    fn remove(&mut self, key: &SegKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
        }
        self.pending.remove(key);
    }
}

pub struct SegmentCache {
    inner: Mutex<CacheInner>,
    store: SharedStore,
}

impl SegmentCache {
    pub fn new(store: SharedStore, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                pending: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            store,
        }
    }

    fn key_for(start: &Title, end: &Title) -> SegKey {
        (start.as_str().to_string(), end.as_str().to_string())
    }

    /// Look up a cached path between two titles. Memory hits move to MRU;
    /// misses fall through to the durable tier and promote on hit. Either
    /// hit bumps the use count and last-used stamp.
    pub fn lookup(&self, start: &Title, end: &Title) -> Option<Vec<Title>> {
        let key = Self::key_for(start, end);
        let now = Utc::now().timestamp_millis();
        let mut g = self.inner.lock();
        let memory_hit = g.entries.get_mut(&key).map(|entry| {
            entry.segment.use_count += 1;
            entry.segment.last_used = now;
            entry.segment.clone()
        });
        if let Some(updated) = memory_hit {
            g.touch(&key);
            let titles = updated.titles.clone();
            g.pending.insert(key, updated);
            g.hits += 1;
            return Some(titles);
        }
        let durable = self.store.0.lock().get_segment(&key).cloned();
        match durable {
            Some(mut seg) => {
                seg.use_count += 1;
                seg.last_used = now;
                let titles = seg.titles.clone();
                g.pending.insert(key, seg.clone());
                g.insert(seg, true);
                g.hits += 1;
                Some(titles)
            }
            None => {
                g.misses += 1;
                None
            }
        }
    }

    /// Insert a freshly validated path: every bounded sub-segment goes into
    /// the LRU and is queued for the durable tier. Re-inserting the same
    /// path only bumps use counts.
    pub fn insert(&self, path: &[Title]) {
        let now = Utc::now().timestamp_millis();
        let mut g = self.inner.lock();
        for titles in extract_segments(path) {
            let (Some(first), Some(last)) = (titles.first(), titles.last()) else { continue };
            let key: SegKey = (first.as_str().to_string(), last.as_str().to_string());
            let prior_uses = match g.entries.get(&key) {
                Some(existing) if existing.segment.hops() < titles.len() - 1 => {
                    // Keep the shorter stored path untouched.
                    continue;
                }
                Some(existing) => existing.segment.use_count,
                None => 0,
            };
            let seg = Segment {
                start: first.clone(),
                end: last.clone(),
                titles: titles.clone(),
                use_count: prior_uses + 1,
                last_used: now,
            };
            g.pending.insert(key, seg.clone());
            g.insert(seg, true);
        }
    }

    /// Drop one (start, end) entry from both tiers. Used when revalidation
    /// finds a stale edge.
    pub fn invalidate(&self, start: &Title, end: &Title) {
        let key = Self::key_for(start, end);
        {
            let mut g = self.inner.lock();
            g.remove(&key);
        }
        let mut s = self.store.0.lock();
        if s.remove_segment(&key) {
            debug!(target: "wikipath::cache", "invalidated stale segment {} -> {}", start, end);
        }
    }

    /// Load up to `limit` most-recently-used durable segments into memory.
    /// Returns the number loaded.
    pub fn warm(&self, limit: usize) -> usize {
        let mut segs = self.store.0.lock().most_recent_segments(limit);
        // Insert coldest first so the most recent end up at MRU.
        segs.reverse();
        let mut g = self.inner.lock();
        let n = segs.len();
        for seg in segs {
            g.insert(seg, false);
        }
        n
    }

    pub fn stats(&self) -> CacheStats {
        let g = self.inner.lock();
        let total = g.hits + g.misses;
        CacheStats {
            size: g.entries.len(),
            hits: g.hits,
            misses: g.misses,
            hit_rate: if total == 0 { 0.0 } else { g.hits as f64 / total as f64 },
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Drain queued upserts into the durable tier and snapshot it. Returns
    /// the number of segments written.
    pub fn flush_pending(&self) -> anyhow::Result<usize> {
        let drained: Vec<Segment> = {
            let mut g = self.inner.lock();
            g.pending.drain().map(|(_, seg)| seg).collect()
        };
        if drained.is_empty() {
            return Ok(0);
        }
        let n = drained.len();
        let mut s = self.store.0.lock();
        for seg in drained {
            s.upsert_segment(seg);
        }
        s.save()?;
        Ok(n)
    }

    /// Age out and cap the durable tier. Returns removed count.
    pub fn compact_durable(&self, ttl_days: i64, cap: usize) -> anyhow::Result<usize> {
        let mut s = self.store.0.lock();
        let removed = s.compact_segments(ttl_days, cap);
        if removed > 0 {
            s.save()?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(s: &str) -> Title {
        Title::normalize(s).expect("title")
    }

    fn path(titles: &[&str]) -> Vec<Title> {
        titles.iter().map(|s| title(s)).collect()
    }

    fn cache_with_capacity(capacity: usize) -> (SegmentCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SharedStore::new(dir.path()).expect("store");
        (SegmentCache::new(store, capacity), dir)
    }

    #[test]
    fn extract_segments_bounds() {
        let p = path(&["A", "B", "C", "D"]);
        let segs = extract_segments(&p);
        // windows of width 2, 3 and 4: 3 + 2 + 1
        assert_eq!(segs.len(), 6);
        for s in &segs {
            assert!(s.len() >= 2 && s.len() <= MAX_SEGMENT_TITLES);
            // every segment is a contiguous sub-sequence of p
            let start = p.iter().position(|t| t == &s[0]).expect("in path");
            assert_eq!(&p[start..start + s.len()], s.as_slice());
        }

        let long: Vec<String> = (0..30).map(|i| format!("N{}", i)).collect();
        let long: Vec<Title> = long.iter().map(|s| title(s)).collect();
        for s in extract_segments(&long) {
            assert!(s.len() <= MAX_SEGMENT_TITLES);
        }

        assert!(extract_segments(&path(&["A"])).is_empty());
    }

    #[test]
    fn lru_evicts_least_recently_used_first() {
        let (cache, _dir) = cache_with_capacity(2);
        cache.insert(&path(&["A", "B"]));
        cache.insert(&path(&["C", "D"]));
        // Touch (A, B) so (C, D) becomes coldest.
        assert!(cache.lookup(&title("A"), &title("B")).is_some());
        cache.insert(&path(&["E", "F"]));
        let g = cache.inner.lock();
        assert!(g.entries.contains_key(&("A".to_string(), "B".to_string())));
        assert!(g.entries.contains_key(&("E".to_string(), "F".to_string())));
        assert!(!g.entries.contains_key(&("C".to_string(), "D".to_string())));
    }

    #[test]
    fn evicted_entries_spill_to_durable_tier() {
        let (cache, _dir) = cache_with_capacity(1);
        cache.insert(&path(&["A", "B"]));
        cache.insert(&path(&["C", "D"]));
        cache.flush_pending().expect("flush");
        // (A, B) was evicted from memory but must still hit via durable.
        assert!(cache.lookup(&title("A"), &title("B")).is_some());
    }

    #[test]
    fn insert_twice_only_bumps_use_count() {
        let (cache, _dir) = cache_with_capacity(16);
        let p = path(&["A", "B", "C"]);
        cache.insert(&p);
        let first: Vec<(SegKey, u64, Vec<Title>)> = {
            let g = cache.inner.lock();
            let mut v: Vec<_> = g
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.segment.use_count, e.segment.titles.clone()))
                .collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };
        cache.insert(&p);
        let second: Vec<(SegKey, u64, Vec<Title>)> = {
            let g = cache.inner.lock();
            let mut v: Vec<_> = g
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.segment.use_count, e.segment.titles.clone()))
                .collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.0, b.0);
            assert_eq!(a.2, b.2);
            assert_eq!(b.1, a.1 + 1);
        }
    }

    #[test]
    fn shorter_existing_path_survives_longer_insert() {
        let (cache, _dir) = cache_with_capacity(16);
        cache.insert(&path(&["A", "C"]));
        cache.insert(&path(&["A", "B", "C"]));
        let found = cache.lookup(&title("A"), &title("C")).expect("hit");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let (cache, _dir) = cache_with_capacity(4);
        cache.insert(&path(&["A", "B"]));
        assert!(cache.lookup(&title("A"), &title("B")).is_some());
        assert!(cache.lookup(&title("X"), &title("Y")).is_none());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn invalidate_removes_from_both_tiers() {
        let (cache, _dir) = cache_with_capacity(4);
        cache.insert(&path(&["A", "B"]));
        cache.flush_pending().expect("flush");
        cache.invalidate(&title("A"), &title("B"));
        assert!(cache.lookup(&title("A"), &title("B")).is_none());
    }

    #[test]
    fn warm_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = SharedStore::new(dir.path()).expect("store");
            let cache = SegmentCache::new(store, 16);
            cache.insert(&path(&["A", "B", "C"]));
            cache.flush_pending().expect("flush");
        }
        let store = SharedStore::new(dir.path()).expect("reopen");
        let durable_count = store.0.lock().segment_count();
        let cache = SegmentCache::new(store, 16);
        let warmed = cache.warm(16);
        assert_eq!(warmed, durable_count);
        assert!(cache.lookup(&title("A"), &title("C")).is_some());
        // The warm-loaded set equals the durable set (capacity permitting).
        assert_eq!(cache.inner.lock().entries.len(), durable_count);
    }
}
