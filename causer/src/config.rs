//! Compile-time tunables. Direct port of the original `xdefines.hh` constants.
//!
//! Every value here is a deliberate design constant, not something meant to
//! be read from the environment — spec.md §6 is explicit that configuration
//! is compile-time only, with build-time feature switches (see `Cargo.toml`)
//! covering the rest.

/// Thread table size. Fatal if exhausted (spec.md §7).
pub const MAX_ALIVE_THREADS: usize = 1025;

/// Hardware watchpoint slots. Four is the typical x86-64 debug-register budget.
pub const MAX_WATCHPOINTS: usize = 4;
pub const WP_SEARCH_INDEX_MASK: usize = MAX_WATCHPOINTS - 1;

/// Call-site map bucket count, power of two for bitmask indexing.
pub const CALLSTACK_MAP_BUCKETS: usize = 1 << 19;

/// Captured frame capacity per callsite record.
pub const MAX_CALLSTACK_DEPTH: usize = 14;

pub const R_CAP: i64 = 10_000;
pub const R_CAP_SECOND: i64 = 100_000;
pub const HOT_THRESHOLD: u64 = 5_000;
pub const PERIOD_MS: u64 = 10_000;
pub const REDZONE_SIZE: usize = 1;

/// Reduce ratio to `WATCHED_REDUCTION / 10` of its value on a watched install.
pub const WATCHED_REDUCTION: i64 = 5;
/// Subtract this on a merely-called (not watched) update.
pub const CALLED_REDUCTION: i64 = 1;
pub const R_MIN: i64 = 1;
pub const R_INIT: i64 = 5_000;

pub const WP_INSTALL_MIN_MS: u64 = 1;
pub const WP_PREEMPT_WEIGHT: f64 = 2.0;
pub const WP_PREEMPT_TIME_REDUCTION_BASE_MS: f64 = 10_000.0;

pub const SENTINEL_HEAD_WORD: u64 = 0xCAFE_BABE_CAFE_BABE;
pub const SENTINEL_TAIL_WORD: u64 = 0xDADE_BABE_DADE_BABE;

/// Offset magic used to detect the loader's internal strcmp fast path; see
/// `trap::checkGlibcWl` equivalent.
pub const LD_STRCMP_PROBE_OFFSET: usize = 0x352f0;

/// Signal used to deliver watchpoint traps (`F_SETSIG` target).
pub const WP_SIGNAL: libc::c_int = libc::SIGTRAP;

/// Size, in bytes, of the static bootstrap bump-pointer region (§4.C) used to
/// serve allocations before the real allocator has been resolved via dlsym.
pub const BOOTSTRAP_ARENA_SIZE: usize = 1 << 20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchpoint_mask_matches_slot_count() {
        assert_eq!(WP_SEARCH_INDEX_MASK, MAX_WATCHPOINTS - 1);
        assert_eq!(MAX_WATCHPOINTS.count_ones(), 1, "must be power of two");
    }

    #[test]
    fn bucket_count_is_power_of_two() {
        assert_eq!(CALLSTACK_MAP_BUCKETS.count_ones(), 1);
    }
}
