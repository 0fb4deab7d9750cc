//!
//! wikipath storage module
//! -----------------------
//! On-disk persistence under a single data folder:
//! - `search_records.jsonl` — append-only JSON lines, one per completed
//!   search, with a monotonically increasing identifier. Records are
//!   permanent once written.
//! - `segments/snapshot.bin` — the durable tier of the segment cache, a
//!   bincode snapshot written via temp file + atomic rename so a partial
//!   write can never corrupt the previous snapshot.
//!
//! The public API centers around the `Store` type, wrapped in a thread-safe
//! `SharedStore` (`Arc<Mutex<Store>>`) elsewhere in the codebase.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::title::Title;

/// Durable segment key: normalized (start, end) title pair.
pub type SegKey = (String, String);

/// A reusable path keyed by its endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start: Title,
    pub end: Title,
    pub titles: Vec<Title>,
    pub use_count: u64,
    /// Epoch milliseconds of the last lookup or insertion.
    pub last_used: i64,
}

impl Segment {
    pub fn key(&self) -> SegKey {
        (self.start.as_str().to_string(), self.end.as_str().to_string())
    }

    pub fn hops(&self) -> usize {
        self.titles.len().saturating_sub(1)
    }
}

/// Persistent log entry for one search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: i64,
    pub start: String,
    pub end: String,
    pub resolved_start: Option<String>,
    pub resolved_end: Option<String>,
    pub success: bool,
    pub pages_checked: u64,
    pub elapsed_ms: u64,
    pub paths: Vec<Vec<Title>>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SegmentSnapshot {
    version: u32,
    created_ms: i64,
    entries: Vec<Segment>,
}

pub struct Store {
    root: PathBuf,
    next_record_id: i64,
    segments: HashMap<SegKey, Segment>,
    dirty: bool,
}

impl Store {
    /// Open (or initialize) a store rooted at the given folder. Loads the
    /// existing segment snapshot and scans the record log for the next id.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating data root {}", root.display()))?;
        fs::create_dir_all(root.join("segments"))
            .with_context(|| format!("creating segments folder under {}", root.display()))?;
        let mut store = Self { root, next_record_id: 1, segments: HashMap::new(), dirty: false };
        store.load_snapshot();
        store.next_record_id = store.scan_next_record_id()?;
        Ok(store)
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root
    }

    fn records_path(&self) -> PathBuf {
        self.root.join("search_records.jsonl")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("segments").join("snapshot.bin")
    }

    fn scan_next_record_id(&self) -> Result<i64> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(1);
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut max_id = 0;
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SearchRecord>(line) {
                Ok(rec) => max_id = max_id.max(rec.id),
                Err(e) => warn!(target: "wikipath::storage", "skipping unreadable record line: {}", e),
            }
        }
        Ok(max_id + 1)
    }

    /// Append one search record, assigning its identifier. The write is a
    /// single line append followed by a flush, so a crash mid-write leaves at
    /// most one truncated trailing line which later scans skip.
    pub fn append_record(&mut self, mut rec: SearchRecord) -> Result<i64> {
        rec.id = self.next_record_id;
        let line = serde_json::to_string(&rec)?;
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.records_path())
            .with_context(|| format!("opening {}", self.records_path().display()))?;
        writeln!(f, "{}", line)?;
        f.flush()?;
        self.next_record_id += 1;
        Ok(rec.id)
    }

    /// Most recent records first, up to `limit`.
    pub fn recent_records(&self, limit: usize) -> Result<Vec<SearchRecord>> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut records: Vec<SearchRecord> = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    pub fn get_segment(&self, key: &SegKey) -> Option<&Segment> {
        self.segments.get(key)
    }

    /// Insert or replace a segment. An existing segment for the same
    /// endpoints is only replaced when the incoming path is no longer than
    /// the stored one; use counts are merged by maximum.
    pub fn upsert_segment(&mut self, seg: Segment) {
        let key = seg.key();
        let existing = self.segments.get(&key).map(|old| (old.hops(), old.use_count));
        match existing {
            Some((old_hops, _)) if old_hops < seg.hops() => return,
            Some((_, old_uses)) => {
                let mut merged = seg;
                merged.use_count = merged.use_count.max(old_uses);
                self.segments.insert(key, merged);
            }
            None => {
                self.segments.insert(key, seg);
            }
        }
        self.dirty = true;
    }

    pub fn remove_segment(&mut self, key: &SegKey) -> bool {
        let removed = self.segments.remove(key).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Up to `limit` segments, most recently used first. Used for cache
    /// warm-up at startup.
    pub fn most_recent_segments(&self, limit: usize) -> Vec<Segment> {
        let mut segs: Vec<Segment> = self.segments.values().cloned().collect();
        segs.sort_by(|a, b| b.last_used.cmp(&a.last_used).then_with(|| a.key().cmp(&b.key())));
        segs.truncate(limit);
        segs
    }

    /// Drop segments unused for more than `ttl_days`, then enforce `cap` by
    /// discarding the least recently used remainder. Returns removed count.
    pub fn compact_segments(&mut self, ttl_days: i64, cap: usize) -> usize {
        let cutoff = Utc::now().timestamp_millis() - ttl_days * 24 * 3600 * 1000;
        let before = self.segments.len();
        self.segments.retain(|_, s| s.last_used >= cutoff);
        if self.segments.len() > cap {
            let keep: std::collections::HashSet<SegKey> = self
                .most_recent_segments(cap)
                .into_iter()
                .map(|s| s.key())
                .collect();
            self.segments.retain(|k, _| keep.contains(k));
        }
        let removed = before - self.segments.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Write the segment snapshot if anything changed since the last save.
    /// Temp file + rename keeps the previous snapshot intact on a crash.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let snap = SegmentSnapshot {
            version: SNAPSHOT_VERSION,
            created_ms: Utc::now().timestamp_millis(),
            entries: self.segments.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&snap)?;
        let tmp = self.snapshot_path().with_extension("bin.tmp");
        fs::write(&tmp, bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, self.snapshot_path())
            .with_context(|| format!("renaming into {}", self.snapshot_path().display()))?;
        self.dirty = false;
        Ok(())
    }

    fn load_snapshot(&mut self) {
        let path = self.snapshot_path();
        if !path.exists() {
            return;
        }
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "wikipath::storage", "unreadable segment snapshot, starting empty: {}", e);
                return;
            }
        };
        match bincode::deserialize::<SegmentSnapshot>(&bytes) {
            Ok(snap) if snap.version == SNAPSHOT_VERSION => {
                for seg in snap.entries {
                    self.segments.insert(seg.key(), seg);
                }
                debug!(target: "wikipath::storage", "loaded {} durable segments", self.segments.len());
            }
            Ok(snap) => {
                warn!(target: "wikipath::storage", "segment snapshot version {} unsupported, starting empty", snap.version);
            }
            Err(e) => {
                warn!(target: "wikipath::storage", "corrupt segment snapshot, starting empty: {}", e);
            }
        }
    }
}

/// Thread-safe handle shared by the cache, the engine and the HTTP surface.
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Store::new(root)?))))
    }

    pub fn root_path(&self) -> PathBuf {
        self.0.lock().root_path().clone()
    }
}
