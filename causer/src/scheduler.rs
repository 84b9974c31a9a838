//! Component F: the adaptive watchpoint scheduling policy.
//!
//! Decides, for every allocation, whether it gets a hardware watchpoint —
//! for free if a slot is idle, or probabilistically by preempting a less
//! "interesting" installed site otherwise — and maintains each call site's
//! `watched_ratio` as allocations accumulate. Grounded directly in the
//! original `causer::startWatch`/`updateWatchedInfo`/`checkPointer`: the
//! probabilistic preemption draw (gated by `config::HOT_THRESHOLD`, drawing
//! from `R_CAP` vs `R_CAP_SECOND`) and the ratio decay/floor/pin rules are
//! carried over field for field.

use crate::callsite::{CallsiteRecord, CallsiteTable, Fingerprint};
use crate::config::{CALLED_REDUCTION, HOT_THRESHOLD, PERIOD_MS, R_CAP, R_CAP_SECOND, R_MIN, WATCHED_REDUCTION};
use crate::thread_registry::ThreadRegistry;
use crate::watchpoints::{InstallOutcome, Watchpoints};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Scheduler {
    pub callsites: CallsiteTable,
    pub watchpoints: Watchpoints,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            callsites: CallsiteTable::new(),
            watchpoints: Watchpoints::new(),
        }
    }

    /// Resolve the call-site record for a captured stack, creating it if
    /// this is the first time the site is seen. Exposed separately from
    /// [`start_watch`](Self::start_watch) so callers (the allocator shims)
    /// can stamp the record into an object's guard header before the
    /// watchpoint install decision is made.
    pub fn resolve_callsite(&self, frames: &[u64]) -> Arc<CallsiteRecord> {
        self.callsites.find_or_add(Fingerprint::capture(frames))
    }

    /// Attempt to arm a watchpoint on the tail redzone of a freshly
    /// allocated object, already attributed to `record`. `object_start`/
    /// `size` describe the guarded region. Returns `true` if a watchpoint
    /// was actually installed.
    pub fn start_watch(&self, object_start: u64, size: usize, record: Arc<CallsiteRecord>, registry: &ThreadRegistry) -> bool {
        let watch_addr = object_start + size as u64;

        if self.watchpoints.active_count() < crate::config::MAX_WATCHPOINTS {
            if self.watchpoints.install(watch_addr, object_start, size, record.clone(), false, registry)
                == InstallOutcome::Installed
            {
                self.update_watched_info(&record, true);
                return true;
            }
        } else if cfg!(feature = "preempt") {
            let periodcalled = record.period_called.load(Ordering::Relaxed);
            let ratio = record.watched_ratio();
            let draw = if periodcalled < HOT_THRESHOLD {
                rand::thread_rng().gen_range(0..R_CAP)
            } else {
                rand::thread_rng().gen_range(0..R_CAP_SECOND)
            };
            if draw <= ratio
                && self.watchpoints.install(watch_addr, object_start, size, record.clone(), true, registry)
                    == InstallOutcome::Installed
            {
                self.update_watched_info(&record, true);
                return true;
            }
        }

        self.update_watched_info(&record, false);
        false
    }

    pub fn stop_watch(&self, object_start: u64, registry: &ThreadRegistry) {
        self.watchpoints.disable_by_object_start(object_start, registry);
    }

    /// Update a call site's counters after an allocation either got a
    /// watchpoint (`watched = true`) or merely passed through
    /// (`watched = false`). Mirrors `updateWatchedInfo`.
    fn update_watched_info(&self, record: &Arc<CallsiteRecord>, watched: bool) {
        record.called_counter.fetch_add(1, Ordering::Relaxed);
        record.period_called.fetch_add(1, Ordering::Relaxed);

        if watched {
            record.watched_counter.fetch_add(1, Ordering::Relaxed);
            record
                .watched_ratio
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| {
                    if r == R_CAP {
                        Some(r)
                    } else {
                        Some(((r as f64) * (WATCHED_REDUCTION as f64 / 10.0)) as i64)
                    }
                })
                .ok();
        } else {
            record
                .watched_ratio
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| {
                    if r == R_CAP {
                        Some(r)
                    } else {
                        Some(r - CALLED_REDUCTION)
                    }
                })
                .ok();
        }

        record
            .watched_ratio
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |r| Some(r.max(R_MIN)))
            .ok();

        let now = now_ms();
        let period = record.period.load(Ordering::Relaxed);
        if now.saturating_sub(period) > PERIOD_MS {
            record.period_called.store(0, Ordering::Relaxed);
            record.period.store(now, Ordering::Relaxed);
        }
    }

    /// Pin a call site's ratio to the cap, marking it as proven-overflowing
    /// so the scheduler always tries to watch it again. Called by the
    /// `evidence` guard check on free and by the end-of-run memory scan.
    /// Mirrors `checkPointer`'s `watchedRatio = MAX_WATCH_RATIO_UPPERBOUND`.
    pub fn pin_overflowed(&self, record: &CallsiteRecord) {
        record.watched_ratio.store(R_CAP, Ordering::Relaxed);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watched_install_halves_ratio() {
        let sched = Scheduler::new();
        let fp = Fingerprint::capture(&[0x10]);
        let record = sched.callsites.find_or_add(fp);
        sched.update_watched_info(&record, true);
        assert_eq!(record.watched_ratio(), (crate::config::R_INIT as f64 * 0.5) as i64);
        assert_eq!(record.watched_counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn called_without_watch_decrements_ratio() {
        let sched = Scheduler::new();
        let fp = Fingerprint::capture(&[0x11]);
        let record = sched.callsites.find_or_add(fp);
        sched.update_watched_info(&record, false);
        assert_eq!(record.watched_ratio(), crate::config::R_INIT - CALLED_REDUCTION);
    }

    #[test]
    fn ratio_never_drops_below_floor() {
        let sched = Scheduler::new();
        let fp = Fingerprint::capture(&[0x12]);
        let record = sched.callsites.find_or_add(fp);
        record.watched_ratio.store(R_MIN, Ordering::Relaxed);
        sched.update_watched_info(&record, false);
        assert_eq!(record.watched_ratio(), R_MIN);
    }

    #[test]
    fn pinned_ratio_is_absorbing() {
        let sched = Scheduler::new();
        let fp = Fingerprint::capture(&[0x13]);
        let record = sched.callsites.find_or_add(fp);
        sched.pin_overflowed(&record);
        assert_eq!(record.watched_ratio(), R_CAP);
        sched.update_watched_info(&record, true);
        assert_eq!(record.watched_ratio(), R_CAP, "pinned ratio must not decay");
    }

    #[test]
    fn first_allocation_under_slot_budget_gets_watched() {
        let sched = Scheduler::new();
        let registry = ThreadRegistry::new();
        let record = sched.resolve_callsite(&[0x4444]);
        let watched = sched.start_watch(0x4000, 16, record, &registry);
        assert!(watched);
        assert_eq!(sched.watchpoints.active_count(), 1);
    }
}
