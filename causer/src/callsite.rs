//! Component B: call-site fingerprinting and the call-site record table.
//!
//! Every allocation is attributed to the call site that made it: the
//! allocation's immediate caller frame plus a short stack above it, reduced
//! to a stable 64-bit fingerprint. Records are kept in a fixed-bucket table
//! with a lock per bucket, mirroring the original `HashMap<callstack,
//! CallSite*, spinlock>` from `hashmap.hh`/`hashfuncs.hh`, reimplemented with
//! `std::sync::Mutex` bucket guards and atomics inside each record so the
//! scheduler can update ratios without holding the bucket lock.

use crate::config::{CALLSTACK_MAP_BUCKETS, MAX_CALLSTACK_DEPTH, R_INIT};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A captured, truncated stack of return addresses, oldest caller first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    frames: [u64; MAX_CALLSTACK_DEPTH],
    depth: u8,
}

impl Fingerprint {
    pub fn capture(frames: &[u64]) -> Self {
        let depth = frames.len().min(MAX_CALLSTACK_DEPTH);
        let mut buf = [0u64; MAX_CALLSTACK_DEPTH];
        buf[..depth].copy_from_slice(&frames[..depth]);
        Self {
            frames: buf,
            depth: depth as u8,
        }
    }

    /// Stable hash over the captured frames, following the FNV-style mixing
    /// used for pointer keys in `hashfuncs.hh::hashAddr`.
    pub fn hash(&self) -> u64 {
        let mut h: u64 = 0;
        for &f in &self.frames[..self.depth as usize] {
            let mut key = f;
            key ^= (key << 15) ^ 0xcd7d_cd7d;
            key ^= key >> 10;
            key ^= key << 3;
            key ^= key >> 6;
            key ^= (key << 2).wrapping_add(key << 14);
            key ^= key >> 16;
            h ^= key.wrapping_add(0x9e37_79b9).wrapping_add(h << 6).wrapping_add(h >> 2);
        }
        h
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.depth as usize]
    }
}

/// Per-call-site bookkeeping. The ratio fields drive `scheduler`'s install
/// and preemption decisions; everything here is updated with relaxed
/// atomics since exact ordering across call sites doesn't matter, only the
/// value read at decision time.
pub struct CallsiteRecord {
    pub fingerprint: Fingerprint,
    pub called_counter: AtomicU64,
    pub watched_counter: AtomicU64,
    /// Fixed-point ratio, stored as `ratio * 1` in the original's integer
    /// scheme; kept as a plain i64 here, see `config::R_INIT`/`R_CAP`.
    pub watched_ratio: AtomicI64,
    /// Rolling window counters, reset each `config::PERIOD_MS`.
    pub period: AtomicU64,
    pub period_called: AtomicU64,
    #[cfg(feature = "statistics")]
    pub alloc_index: AtomicU64,
}

impl CallsiteRecord {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            called_counter: AtomicU64::new(0),
            watched_counter: AtomicU64::new(0),
            watched_ratio: AtomicI64::new(R_INIT),
            period: AtomicU64::new(0),
            period_called: AtomicU64::new(0),
            #[cfg(feature = "statistics")]
            alloc_index: AtomicU64::new(0),
        }
    }

    pub fn watched_ratio(&self) -> i64 {
        self.watched_ratio.load(Ordering::Relaxed)
    }
}

struct Bucket {
    entries: Mutex<Vec<Arc<CallsiteRecord>>>,
}

pub struct CallsiteTable {
    buckets: Vec<Bucket>,
}

impl CallsiteTable {
    pub fn new() -> Self {
        Self::with_bucket_count(CALLSTACK_MAP_BUCKETS)
    }

    fn with_bucket_count(n: usize) -> Self {
        assert!(n.is_power_of_two());
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, || Bucket {
            entries: Mutex::new(Vec::new()),
        });
        Self { buckets }
    }

    fn index_for(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Look up the record for `fingerprint`, creating it with default
    /// (unwatched) state if this is the first time the call site is seen.
    /// Mirrors `HashMap::findOrAdd`.
    pub fn find_or_add(&self, fingerprint: Fingerprint) -> Arc<CallsiteRecord> {
        let hash = fingerprint.hash();
        let idx = self.index_for(hash);
        let mut entries = self.buckets[idx].entries.lock().expect("callsite bucket lock poisoned");
        if let Some(existing) = entries.iter().find(|r| r.fingerprint == fingerprint) {
            return existing.clone();
        }
        let record = Arc::new(CallsiteRecord::new(fingerprint));
        entries.push(record.clone());
        record
    }

    /// Seed the table with a record recovered from a persisted history
    /// file, for a call site never encountered in this run yet. If the
    /// fingerprint already has a live record (possible if the application
    /// already hit the same site before history finished loading), the
    /// loaded counters are ignored and the live record wins.
    pub fn insert_loaded(&self, fingerprint: Fingerprint, called_counter: u64, watched_counter: u64, watched_ratio: i64) -> Arc<CallsiteRecord> {
        let hash = fingerprint.hash();
        let idx = self.index_for(hash);
        let mut entries = self.buckets[idx].entries.lock().expect("callsite bucket lock poisoned");
        if let Some(existing) = entries.iter().find(|r| r.fingerprint == fingerprint) {
            return existing.clone();
        }
        let record = Arc::new(CallsiteRecord {
            fingerprint,
            called_counter: AtomicU64::new(called_counter),
            watched_counter: AtomicU64::new(watched_counter),
            watched_ratio: AtomicI64::new(watched_ratio),
            period: AtomicU64::new(0),
            period_called: AtomicU64::new(0),
            #[cfg(feature = "statistics")]
            alloc_index: AtomicU64::new(0),
        });
        entries.push(record.clone());
        record
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.lock().expect("callsite bucket lock poisoned").len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot all records, for history persistence and end-of-run scans.
    pub fn snapshot(&self) -> Vec<Arc<CallsiteRecord>> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.lock().expect("callsite bucket lock poisoned").clone())
            .collect()
    }
}

impl Default for CallsiteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_frames_hash_identically() {
        let a = Fingerprint::capture(&[0x1000, 0x2000, 0x3000]);
        let b = Fingerprint::capture(&[0x1000, 0x2000, 0x3000]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn different_frames_usually_hash_differently() {
        let a = Fingerprint::capture(&[0x1000, 0x2000]);
        let b = Fingerprint::capture(&[0x1000, 0x2001]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn find_or_add_returns_same_record_for_repeat_site() {
        let table = CallsiteTable::with_bucket_count(16);
        let fp = Fingerprint::capture(&[0xdead, 0xbeef]);
        let r1 = table.find_or_add(fp.clone());
        r1.called_counter.fetch_add(1, Ordering::Relaxed);
        let r2 = table.find_or_add(fp);
        assert_eq!(r2.called_counter.load(Ordering::Relaxed), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_sites_get_distinct_records() {
        let table = CallsiteTable::with_bucket_count(16);
        table.find_or_add(Fingerprint::capture(&[0x1]));
        table.find_or_add(Fingerprint::capture(&[0x2]));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn new_record_starts_at_init_ratio() {
        let table = CallsiteTable::with_bucket_count(16);
        let r = table.find_or_add(Fingerprint::capture(&[0x42]));
        assert_eq!(r.watched_ratio(), R_INIT);
    }
}
