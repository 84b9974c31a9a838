//! Component D: thread registry.
//!
//! Tracks every alive thread in the host process so the scheduler can fan
//! out watchpoint installs across all of them and the trap handler can find
//! out which thread's watchpoint just fired. Grounded in the original
//! `xthread.hh`/`threadstruct.hh`: a fixed-size slot table, a round-robin
//! `_threadIndex` cursor for allocation, and a single process-wide
//! reader/writer lock (`G_RW` there, [`ThreadRegistry::lock`] here) guarding
//! slot allocation/reclaim against the scheduler's fan-out reads. Lock order
//! is always slot-local state, if any, before `G_RW` — never the reverse.

use crate::config::MAX_ALIVE_THREADS;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::RwLock;

pub struct Slot {
    pub available: AtomicBool,
    pub index: usize,
    /// Linux TID (`gettid()`), set once the slot's thread has actually
    /// started running, zero otherwise.
    pub tid: AtomicI32,
    /// Frame-pointer value at thread-entry, used to bound stack walks so
    /// `callsite::Fingerprint::capture` never walks into a parent thread's
    /// stack after a `clone()`-backed reuse of the same VMA range.
    pub start_frame: std::sync::atomic::AtomicU64,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            available: AtomicBool::new(true),
            index,
            tid: AtomicI32::new(0),
            start_frame: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    total_alive: usize,
    next_index: usize,
}

/// Process-wide thread table. A single instance lives in `lib.rs`'s global
/// `Core`. All mutation goes through the writer side of `lock`; watchpoint
/// fan-out and trap lookups take the reader side.
pub struct ThreadRegistry {
    inner: RwLock<Inner>,
}

thread_local! {
    static CURRENT_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

impl ThreadRegistry {
    pub fn new() -> Self {
        let slots = (0..MAX_ALIVE_THREADS).map(Slot::new).collect();
        Self {
            inner: RwLock::new(Inner {
                slots,
                total_alive: 0,
                next_index: 0,
            }),
        }
    }

    /// Allocate a slot for a newly spawned (or the initial) thread. Mirrors
    /// `allocThreadIndex`'s round-robin scan; unlike the original, multiple
    /// callers may race here so this takes the writer lock for the whole
    /// scan rather than relying on a single-spawner invariant.
    pub fn alloc(&self) -> crate::error::Result<usize> {
        let mut inner = self.inner.write().expect("thread registry lock poisoned");
        if inner.total_alive >= inner.slots.len() {
            return Err(crate::error::Error::ThreadTableExhausted(inner.slots.len()));
        }
        let total = inner.slots.len();
        let start = inner.next_index;
        loop {
            let idx = inner.next_index;
            inner.next_index = (inner.next_index + 1) % total;
            if inner.slots[idx].available.load(Ordering::Relaxed) {
                inner.slots[idx].available.store(false, Ordering::Relaxed);
                inner.total_alive += 1;
                CURRENT_INDEX.with(|c| c.set(Some(idx)));
                return Ok(idx);
            }
            if inner.next_index == start {
                return Err(crate::error::Error::ThreadTableExhausted(total));
            }
        }
    }

    /// Record that the calling thread's slot (already allocated) has
    /// actually started running, following `initializeCurrentThread`.
    pub fn mark_started(&self, index: usize, tid: i32, start_frame: u64) {
        let inner = self.inner.read().expect("thread registry lock poisoned");
        inner.slots[index].tid.store(tid, Ordering::Relaxed);
        inner.slots[index].start_frame.store(start_frame, Ordering::Relaxed);
    }

    /// Release a slot on thread exit. The caller is responsible for
    /// disarming any watchpoints pinned to this slot's fd table first
    /// (`watchpoints::Watchpoints::disarm_thread`), matching `threadExit`'s
    /// ordering: disable watchpoints, then mark available, then drop from
    /// the alive count, all under the writer lock.
    pub fn release(&self, index: usize) {
        let mut inner = self.inner.write().expect("thread registry lock poisoned");
        inner.slots[index].available.store(true, Ordering::Relaxed);
        inner.slots[index].tid.store(0, Ordering::Relaxed);
        inner.total_alive = inner.total_alive.saturating_sub(1);
        CURRENT_INDEX.with(|c| c.set(None));
    }

    pub fn current_index(&self) -> Option<usize> {
        CURRENT_INDEX.with(|c| c.get())
    }

    /// Adopt an already-allocated index for the calling OS thread. Used by
    /// `startThread`-equivalent trampolines where allocation happens on the
    /// spawning thread but `current_index()` must resolve on the child.
    pub fn adopt(&self, index: usize) {
        CURRENT_INDEX.with(|c| c.set(Some(index)));
    }

    pub fn total_alive(&self) -> usize {
        self.inner.read().expect("thread registry lock poisoned").total_alive
    }

    /// Run `f` for every currently-alive slot index, holding the reader
    /// lock for the duration. Used by the scheduler to fan a freshly
    /// installed watchpoint out to every live thread's perf fd.
    pub fn for_each_alive<F: FnMut(usize)>(&self, mut f: F) {
        let inner = self.inner.read().expect("thread registry lock poisoned");
        for slot in &inner.slots {
            if !slot.available.load(Ordering::Relaxed) {
                f(slot.index);
            }
        }
    }

    /// As [`Self::for_each_alive`] but also hands back the thread's Linux
    /// tid, needed to target a `perf_event_open` call at that thread.
    pub fn for_each_alive_with_tid<F: FnMut(usize, i32)>(&self, mut f: F) {
        let inner = self.inner.read().expect("thread registry lock poisoned");
        for slot in &inner.slots {
            if !slot.available.load(Ordering::Relaxed) {
                f(slot.index, slot.tid.load(Ordering::Relaxed));
            }
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_increasing_indices_until_reuse() {
        let reg = ThreadRegistry::new();
        let a = reg.alloc().unwrap();
        let b = reg.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.total_alive(), 2);
    }

    #[test]
    fn release_allows_index_reuse() {
        let reg = ThreadRegistry::new();
        let a = reg.alloc().unwrap();
        reg.release(a);
        assert_eq!(reg.total_alive(), 0);
        // exhaust the rest of the table, which can only succeed if `a` was
        // actually returned to the free pool
        let mut seen_a_again = false;
        for _ in 0..MAX_ALIVE_THREADS {
            let idx = reg.alloc().unwrap();
            if idx == a {
                seen_a_again = true;
            }
        }
        assert!(seen_a_again);
    }

    #[test]
    fn exhausting_table_is_an_error() {
        let reg = ThreadRegistry::new();
        for _ in 0..MAX_ALIVE_THREADS {
            reg.alloc().unwrap();
        }
        assert!(reg.alloc().is_err());
    }

    #[test]
    fn for_each_alive_skips_released_slots() {
        let reg = ThreadRegistry::new();
        let a = reg.alloc().unwrap();
        let b = reg.alloc().unwrap();
        reg.release(a);
        let mut seen = Vec::new();
        reg.for_each_alive(|idx| seen.push(idx));
        assert!(!seen.contains(&a));
        assert!(seen.contains(&b));
    }
}
