//! Component E: watchpoint slot table and the `perf_event_open` hardware
//! breakpoint facility.
//!
//! A fixed `config::MAX_WATCHPOINTS` slots, each fanned out to a
//! per-thread `perf_event_open` file descriptor so every alive thread traps
//! on the same watched address. Grounded directly in the original
//! `watchpoint.hh`/`watchpoint.cpp`: the scan-with-preemption loop in
//! [`Watchpoints::install`] mirrors `watchpoint::setWatchpoint`'s slot
//! search and the `WP_PREEMPT_WEIGHT`/`WP_PREEMPT_TIME_REDUCTION_BASE`
//! inequality verbatim.

use crate::callsite::CallsiteRecord;
use crate::config::{
    MAX_ALIVE_THREADS, MAX_WATCHPOINTS, WP_INSTALL_MIN_MS, WP_PREEMPT_TIME_REDUCTION_BASE_MS,
    WP_PREEMPT_WEIGHT, WP_SEARCH_INDEX_MASK, WP_SIGNAL,
};
use crate::thread_registry::ThreadRegistry;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

mod perf {
    //! Raw `perf_event_open(2)` plumbing for a single hardware breakpoint.
    //! `libc` doesn't expose `perf_event_attr`, so the layout is reproduced
    //! here matching `linux/perf_event.h`; only the fields the original
    //! code sets are given real values, the rest are zeroed.

    use std::io;

    const PERF_TYPE_BREAKPOINT: u32 = 5;
    const HW_BREAKPOINT_RW: u32 = 3; // HW_BREAKPOINT_R | HW_BREAKPOINT_W
    const HW_BREAKPOINT_LEN_1: u32 = 1;
    pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

    #[repr(C)]
    #[derive(Default)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period_or_freq: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events_or_watermark: u32,
        bp_type: u32,
        bp_addr_or_config1: u64,
        bp_len_or_config2: u64,
        branch_sample_type: u64,
        sample_regs_user: u64,
        sample_stack_user: u32,
        clockid: i32,
        sample_regs_intr: u64,
        aux_watermark: u32,
        sample_max_stack: u16,
        __reserved_2: u16,
    }

    fn perf_event_open(attr: &PerfEventAttr, pid: libc::pid_t, cpu: libc::c_int, group_fd: libc::c_int, flags: libc::c_ulong) -> libc::c_long {
        unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid,
                cpu,
                group_fd,
                flags,
            )
        }
    }

    /// Install a read/write, 1-byte-wide hardware breakpoint on `address`
    /// for OS thread `tid`, delivering `sig` asynchronously. Returns the
    /// perf event fd, disabled (the caller must [`enable`] it).
    pub fn install(address: u64, tid: libc::pid_t, sig: libc::c_int) -> io::Result<i32> {
        let mut attr = PerfEventAttr {
            type_: PERF_TYPE_BREAKPOINT,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            bp_type: HW_BREAKPOINT_RW,
            bp_len_or_config2: HW_BREAKPOINT_LEN_1 as u64,
            bp_addr_or_config1: address,
            sample_period_or_freq: 1,
            ..Default::default()
        };
        // `disabled` and a few other flag bits live packed in `flags` on
        // the real struct; the attr is opened disabled via `disabled: 1`
        // in the original. We fold that into `flags` bit 0 to match the
        // kernel ABI's bitfield layout for this subset of fields.
        attr.flags |= 1;

        let fd = perf_event_open(&attr, tid, -1, -1, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = fd as i32;

        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) == -1 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
            if libc::fcntl(fd, libc::F_SETSIG, sig) == -1 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
            #[repr(C)]
            struct FOwnerEx {
                type_: libc::c_int,
                pid: libc::pid_t,
            }
            const F_OWNER_TID: libc::c_int = 0;
            const F_SETOWN_EX: libc::c_int = 15;
            let owner = FOwnerEx { type_: F_OWNER_TID, pid: tid };
            if libc::fcntl(fd, F_SETOWN_EX, &owner as *const FOwnerEx) == -1 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
        }
        Ok(fd)
    }

    pub fn enable(fd: i32) -> io::Result<()> {
        if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn disable(fd: i32) {
        if fd < 3 {
            return;
        }
        unsafe {
            libc::ioctl(fd, PERF_EVENT_IOC_DISABLE, 0);
            libc::close(fd);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Slot {
    in_use: AtomicBool,
    addr: AtomicU64,
    object_start: AtomicU64,
    object_size: AtomicUsize,
    install_time_ms: AtomicI64,
    /// Per-thread-index perf fd, `-1` when not installed for that thread.
    fds: Vec<AtomicI32>,
    /// Serializes install/preempt/disable against each other for this slot,
    /// mirroring the original's per-`watchpointObject` spinlock.
    lock: Mutex<()>,
    callsite: Mutex<Option<Arc<CallsiteRecord>>>,
}

impl Slot {
    fn new() -> Self {
        let mut fds = Vec::with_capacity(MAX_ALIVE_THREADS);
        fds.resize_with(MAX_ALIVE_THREADS, || AtomicI32::new(-1));
        Self {
            in_use: AtomicBool::new(false),
            addr: AtomicU64::new(0),
            object_start: AtomicU64::new(0),
            object_size: AtomicUsize::new(0),
            install_time_ms: AtomicI64::new(0),
            fds,
            lock: Mutex::new(()),
            callsite: Mutex::new(None),
        }
    }
}

pub struct Watchpoints {
    slots: [Slot; MAX_WATCHPOINTS],
    cur_index: AtomicUsize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Refused: no free slot and (preemption disabled, or the preemption
    /// inequality did not favor the new object).
    Refused,
}

impl Watchpoints {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            cur_index: AtomicUsize::new(0),
        }
    }

    /// Arm a watchpoint at `addr` (the redzone byte of a guarded object) on
    /// behalf of `callsite`, fanning it out to every thread in `registry`.
    /// Scans up to `MAX_WATCHPOINTS` slots starting at the rotating cursor,
    /// preferring a free slot; if `allow_preempt` and none is free, applies
    /// the preemption inequality against each occupied slot's installed
    /// call site.
    pub fn install(
        &self,
        addr: u64,
        object_start: u64,
        object_size: usize,
        callsite: Arc<CallsiteRecord>,
        allow_preempt: bool,
        registry: &ThreadRegistry,
    ) -> InstallOutcome {
        let start = self.cur_index.load(Ordering::Relaxed);
        for step in 0..MAX_WATCHPOINTS {
            let idx = (start + step) & WP_SEARCH_INDEX_MASK;
            let slot = &self.slots[idx];

            let in_use = slot.in_use.load(Ordering::Acquire);
            if in_use && !allow_preempt {
                continue;
            }

            let _guard = slot.lock.lock().expect("watchpoint slot lock poisoned");
            let in_use = slot.in_use.load(Ordering::Acquire);

            let eligible = if !in_use {
                true
            } else {
                let installed_ratio = slot
                    .callsite
                    .lock()
                    .expect("watchpoint callsite lock poisoned")
                    .as_ref()
                    .map(|c| c.watched_ratio())
                    .unwrap_or(0);
                let diff_ms = now_ms().saturating_sub(slot.install_time_ms.load(Ordering::Relaxed) as u64);
                diff_ms >= WP_INSTALL_MIN_MS
                    && (callsite.watched_ratio() as f64)
                        > (installed_ratio as f64)
                            * WP_PREEMPT_WEIGHT
                            * (1.0 - diff_ms as f64 / WP_PREEMPT_TIME_REDUCTION_BASE_MS)
            };

            if !eligible {
                continue;
            }

            if in_use {
                self.disarm_slot(slot, registry);
            }

            slot.object_start.store(object_start, Ordering::Relaxed);
            slot.object_size.store(object_size, Ordering::Relaxed);
            slot.addr.store(addr, Ordering::Relaxed);
            *slot.callsite.lock().expect("watchpoint callsite lock poisoned") = Some(callsite.clone());

            if self.arm_slot(slot, addr, registry) {
                slot.in_use.store(true, Ordering::Release);
                slot.install_time_ms.store(now_ms() as i64, Ordering::Relaxed);
                self.cur_index.store((idx + 1) & WP_SEARCH_INDEX_MASK, Ordering::Relaxed);
                return InstallOutcome::Installed;
            } else {
                slot.in_use.store(false, Ordering::Release);
            }
        }
        InstallOutcome::Refused
    }

    fn arm_slot(&self, slot: &Slot, addr: u64, registry: &ThreadRegistry) -> bool {
        let mut ok = true;
        let mut armed = Vec::new();
        registry.for_each_alive_with_tid(|idx, tid| {
            if !ok {
                return;
            }
            match perf::install(addr, tid, WP_SIGNAL) {
                Ok(fd) if perf::enable(fd).is_ok() => {
                    slot.fds[idx].store(fd, Ordering::Relaxed);
                    armed.push(idx);
                }
                _ => ok = false,
            }
        });
        if !ok {
            for idx in armed {
                let fd = slot.fds[idx].swap(-1, Ordering::Relaxed);
                perf::disable(fd);
            }
        }
        ok
    }

    /// Install this slot's watchpoint (if occupied) on a newly spawned
    /// thread, mirroring `setWatchpointByThread`. Called once per slot for
    /// the new thread's index.
    pub fn arm_for_new_thread(&self, thread_index: usize, tid: i32) -> bool {
        let mut ok = true;
        for slot in &self.slots {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let addr = slot.addr.load(Ordering::Relaxed);
            match perf::install(addr, tid, WP_SIGNAL) {
                Ok(fd) if perf::enable(fd).is_ok() => {
                    slot.fds[thread_index].store(fd, Ordering::Relaxed);
                }
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        ok
    }

    fn disarm_slot(&self, slot: &Slot, registry: &ThreadRegistry) {
        registry.for_each_alive(|idx| {
            let fd = slot.fds[idx].swap(-1, Ordering::Relaxed);
            perf::disable(fd);
        });
    }

    /// Disarm every slot's fd for a single exiting thread, without touching
    /// `in_use` state for other threads. Mirrors `threadExit`'s
    /// per-watchpoint `disable_watchpoint(wp[i].fd[thread->index])` loop.
    pub fn disarm_thread(&self, thread_index: usize) {
        for slot in &self.slots {
            let fd = slot.fds[thread_index].swap(-1, Ordering::Relaxed);
            perf::disable(fd);
        }
    }

    pub fn disable_by_object_start(&self, object_start: u64, registry: &ThreadRegistry) -> bool {
        for slot in &self.slots {
            let _guard = slot.lock.lock().expect("watchpoint slot lock poisoned");
            if slot.in_use.load(Ordering::Acquire) && slot.object_start.load(Ordering::Relaxed) == object_start {
                self.disarm_slot(slot, registry);
                slot.in_use.store(false, Ordering::Release);
                *slot.callsite.lock().expect("watchpoint callsite lock poisoned") = None;
                return true;
            }
        }
        false
    }

    /// Find which in-use slot owns `fd` for some alive thread index, for
    /// the trap handler to recover the callsite/object metadata, including
    /// the allocation site's own record so the handler can pin its ratio
    /// and print where the object was allocated.
    pub fn find_by_fd(&self, fd: i32) -> Option<(u64, u64, usize, Arc<CallsiteRecord>)> {
        for slot in &self.slots {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            if slot.fds.iter().any(|f| f.load(Ordering::Relaxed) == fd) {
                let callsite = slot.callsite.lock().expect("watchpoint callsite lock poisoned").clone()?;
                return Some((
                    slot.addr.load(Ordering::Relaxed),
                    slot.object_start.load(Ordering::Relaxed),
                    slot.object_size.load(Ordering::Relaxed),
                    callsite,
                ));
            }
        }
        None
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use.load(Ordering::Acquire)).count()
    }
}

impl Default for Watchpoints {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsite::Fingerprint;

    fn record(ratio: i64) -> Arc<CallsiteRecord> {
        let r = Arc::new(CallsiteRecord {
            fingerprint: Fingerprint::capture(&[0x1]),
            called_counter: AtomicU64::new(0),
            watched_counter: AtomicU64::new(0),
            watched_ratio: AtomicI64::new(ratio),
            period: AtomicU64::new(0),
            period_called: AtomicU64::new(0),
            #[cfg(feature = "statistics")]
            alloc_index: AtomicU64::new(0),
        });
        r
    }

    #[test]
    fn slot_cursor_rotates_after_install_attempt() {
        let wps = Watchpoints::new();
        // With no alive threads registered, arm_slot trivially succeeds
        // (for_each_alive iterates zero threads), so installs should occupy
        // slots in rotation.
        let registry = ThreadRegistry::new();
        let outcome = wps.install(0x1000, 0x1000, 16, record(5000), true, &registry);
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(wps.active_count(), 1);
    }

    #[test]
    fn disable_by_object_start_frees_the_slot() {
        let wps = Watchpoints::new();
        let registry = ThreadRegistry::new();
        wps.install(0x2000, 0x2000, 16, record(5000), true, &registry);
        assert!(wps.disable_by_object_start(0x2000, &registry));
        assert_eq!(wps.active_count(), 0);
    }

    #[test]
    fn fills_all_slots_before_needing_preemption() {
        let wps = Watchpoints::new();
        let registry = ThreadRegistry::new();
        for i in 0..MAX_WATCHPOINTS {
            let addr = 0x3000 + i as u64 * 0x100;
            let outcome = wps.install(addr, addr, 16, record(5000), false, &registry);
            assert_eq!(outcome, InstallOutcome::Installed);
        }
        assert_eq!(wps.active_count(), MAX_WATCHPOINTS);
    }
}
