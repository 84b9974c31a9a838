//! Component C: object guard layout.
//!
//! Every allocation handed back to the application is wrapped with a small
//! header carrying a head sentinel, the requested size, a reference to the
//! call site that made the allocation, and a tail sentinel placed
//! immediately after the usable region. Grounded in the original
//! `objectguard.hh`'s `objectHeader`/`objectTrailer` pair (including its
//! `cs` call-site back-pointer); the redzone itself (the single byte the
//! watchpoint actually arms on) sits at the start of the trailer.

use crate::callsite::CallsiteRecord;
use crate::config::{REDZONE_SIZE, SENTINEL_HEAD_WORD, SENTINEL_TAIL_WORD};
use std::mem::size_of;

#[repr(C)]
struct Header {
    sentinel: u64,
    /// Requested (not rounded-up) size, so `checkPointer` equivalents can
    /// report how far past the end a detected write landed.
    requested_size: usize,
    /// Non-owning pointer into the call-site table's record for this
    /// allocation's stack. Valid for the life of the process: call sites
    /// are never removed from `CallsiteTable`, only added. Mirrors
    /// `objectguard.hh`'s `cs` field.
    callsite_ptr: *const CallsiteRecord,
    #[cfg(feature = "statistics")]
    alloc_index: u64,
}

#[repr(C)]
struct Trailer {
    sentinel: u64,
}

pub const HEADER_SIZE: usize = size_of::<Header>();
pub const TRAILER_SIZE: usize = size_of::<Trailer>();

/// Fixed-size field stored immediately before every user pointer, holding
/// the byte distance back to the start of the full `Header`. For a
/// `alignment == 1` allocation this is always `guard_footprint(_, 1)`; for
/// an aligned allocation the footprint is rounded up to a multiple of the
/// requested alignment (so the user pointer itself lands on that
/// alignment), and this field is how [`from_user_ptr`] still finds the
/// header despite the variable gap.
const OFFSET_FIELD_SIZE: usize = size_of::<usize>();

/// Bytes of guard metadata that must precede the user pointer for an
/// allocation aligned to `alignment` (`1` for an ordinary, unaligned
/// allocation). Rounding the footprint itself up to a multiple of
/// `alignment` keeps `base + footprint` aligned whenever `base` already is,
/// which is what the real allocator guarantees for `memalign`-family calls.
/// Mirrors `xxmemalign`'s `objguardsize = (sizeof(objectGuard)+alignment-1)
/// & ~(alignment-1)`.
fn guard_footprint(alignment: usize) -> usize {
    let align = alignment.max(1);
    (HEADER_SIZE + OFFSET_FIELD_SIZE + align - 1) & !(align - 1)
}

/// Total bytes the real allocator must be asked for to back a `requested`
/// byte allocation aligned to `alignment` (`1` for an ordinary allocation):
/// header footprint + payload + trailer.
pub fn total_size(requested: usize, alignment: usize) -> usize {
    guard_footprint(alignment) + requested + REDZONE_SIZE.max(TRAILER_SIZE)
}

/// An allocation as seen by the application, reconstructed from the raw
/// block handed back by the real allocator.
pub struct Guarded {
    pub base: *mut u8,
    pub user_ptr: *mut u8,
    pub requested_size: usize,
    pub callsite_ptr: *const CallsiteRecord,
}

/// Stamp header/trailer sentinels around `requested` usable bytes of `base`,
/// which must be at least `total_size(requested, alignment)` bytes long,
/// placing the user pointer so it honors `alignment` (pass `1` for an
/// ordinary, unaligned allocation).
///
/// # Safety
/// `base` must point to a live allocation of at least
/// `total_size(requested, alignment)` bytes, itself aligned to `alignment`,
/// uniquely owned by the caller.
pub unsafe fn install(
    base: *mut u8,
    requested: usize,
    alignment: usize,
    callsite_ptr: *const CallsiteRecord,
    #[cfg(feature = "statistics")] alloc_index: u64,
) -> Guarded {
    let footprint = guard_footprint(alignment);

    let header = base as *mut Header;
    (*header).sentinel = SENTINEL_HEAD_WORD;
    (*header).requested_size = requested;
    (*header).callsite_ptr = callsite_ptr;
    #[cfg(feature = "statistics")]
    {
        (*header).alloc_index = alloc_index;
    }

    let user_ptr = base.add(footprint);
    (user_ptr.sub(OFFSET_FIELD_SIZE) as *mut usize).write(footprint);

    let trailer = user_ptr.add(requested) as *mut Trailer;
    (*trailer).sentinel = SENTINEL_TAIL_WORD;
    Guarded {
        base,
        user_ptr,
        requested_size: requested,
        callsite_ptr,
    }
}

/// Recover the guard header from a user pointer previously returned by
/// [`install`]. Does not validate sentinels; callers that care about
/// corruption call [`check`] explicitly.
///
/// # Safety
/// `user_ptr` must have been returned by `install`'s `Guarded::user_ptr`.
pub unsafe fn from_user_ptr(user_ptr: *mut u8) -> Guarded {
    let footprint = *(user_ptr.sub(OFFSET_FIELD_SIZE) as *const usize);
    let base = user_ptr.sub(footprint);
    let header = base as *const Header;
    Guarded {
        base,
        user_ptr,
        requested_size: (*header).requested_size,
        callsite_ptr: (*header).callsite_ptr,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Violation {
    HeadCorrupted,
    TailCorrupted,
}

/// Check both sentinels of a guarded allocation. Called on free and,
/// under `scan-memory`, on alive objects at process exit.
///
/// # Safety
/// `g.base` must still point at a live, guarded allocation.
pub unsafe fn check(g: &Guarded) -> Result<(), Violation> {
    let header = g.base as *const Header;
    if (*header).sentinel != SENTINEL_HEAD_WORD {
        return Err(Violation::HeadCorrupted);
    }
    let trailer = g.user_ptr.add(g.requested_size) as *const Trailer;
    if (*trailer).sentinel != SENTINEL_TAIL_WORD {
        return Err(Violation::TailCorrupted);
    }
    Ok(())
}

/// Best-effort reconstruction for the end-of-run memory scan (`scan-memory`
/// feature): `base` is a candidate address whose first word matched the
/// head sentinel during a blind scan of a writable data mapping. Since any
/// 8 bytes of unrelated data could coincidentally equal the sentinel, this
/// additionally rejects the candidate if the recovered `requested_size`
/// looks unreasonable, the same heuristic tradeoff `checkAllMemory` makes.
/// Always assumes `alignment == 1` (the scan cannot know what alignment an
/// orphaned `memalign`-family object used), so it only recovers ordinary
/// `malloc`-family guards.
///
/// # Safety
/// `base` must point to at least `HEADER_SIZE` readable bytes.
pub unsafe fn scan_candidate(base: *mut u8, max_reasonable_size: usize) -> Option<(Guarded, Result<(), Violation>)> {
    let header = base as *const Header;
    if (*header).sentinel != SENTINEL_HEAD_WORD {
        return None;
    }
    let requested_size = (*header).requested_size;
    if requested_size == 0 || requested_size > max_reasonable_size {
        return None;
    }
    let footprint = guard_footprint(1);
    let user_ptr = base.add(footprint);
    let g = Guarded {
        base,
        user_ptr,
        requested_size,
        callsite_ptr: (*header).callsite_ptr,
    };
    let result = check(&g);
    Some((g, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc_backing(n: usize) -> Vec<u8> {
        vec![0u8; n]
    }

    #[test]
    fn install_and_check_round_trip() {
        let requested = 32;
        let mut backing = alloc_backing(total_size(requested, 1));
        let base = backing.as_mut_ptr();
        unsafe {
            let g = install(
                base,
                requested,
                1,
                std::ptr::null(),
                #[cfg(feature = "statistics")]
                0,
            );
            assert!(check(&g).is_ok());
            assert_eq!(g.requested_size, requested);
        }
    }

    #[test]
    fn detects_tail_overwrite() {
        let requested = 16;
        let mut backing = alloc_backing(total_size(requested, 1));
        let base = backing.as_mut_ptr();
        unsafe {
            let g = install(
                base,
                requested,
                1,
                std::ptr::null(),
                #[cfg(feature = "statistics")]
                0,
            );
            // simulate a one-byte overflow write into the trailer's sentinel
            *g.user_ptr.add(requested) = 0xff;
            assert_eq!(check(&g), Err(Violation::TailCorrupted));
        }
    }

    #[test]
    fn from_user_ptr_recovers_size() {
        let requested = 64;
        let mut backing = alloc_backing(total_size(requested, 1));
        let base = backing.as_mut_ptr();
        unsafe {
            let g = install(
                base,
                requested,
                1,
                std::ptr::null(),
                #[cfg(feature = "statistics")]
                0,
            );
            let recovered = from_user_ptr(g.user_ptr);
            assert_eq!(recovered.requested_size, requested);
            assert_eq!(recovered.base, base);
        }
    }

    #[test]
    fn aligned_install_honors_requested_alignment() {
        let requested = 10;
        let alignment = 4096;
        // over-allocate backing + alignment so we can carve out an aligned base
        let mut backing = alloc_backing(total_size(requested, alignment) + alignment);
        let raw = backing.as_mut_ptr();
        let aligned_base = ((raw as usize + alignment - 1) & !(alignment - 1)) as *mut u8;
        unsafe {
            let g = install(
                aligned_base,
                requested,
                alignment,
                std::ptr::null(),
                #[cfg(feature = "statistics")]
                0,
            );
            assert_eq!((g.user_ptr as usize) % alignment, 0);
            assert!(check(&g).is_ok());
            let recovered = from_user_ptr(g.user_ptr);
            assert_eq!(recovered.base, aligned_base);
            assert_eq!(recovered.requested_size, requested);
        }
    }

    #[test]
    fn callsite_ptr_round_trips_through_from_user_ptr() {
        let requested = 8;
        let marker = 0x1234usize as *const CallsiteRecord;
        let mut backing = alloc_backing(total_size(requested, 1));
        let base = backing.as_mut_ptr();
        unsafe {
            let g = install(
                base,
                requested,
                1,
                marker,
                #[cfg(feature = "statistics")]
                0,
            );
            assert_eq!(g.callsite_ptr, marker);
            let recovered = from_user_ptr(g.user_ptr);
            assert_eq!(recovered.callsite_ptr, marker);
        }
    }

    #[test]
    fn scan_candidate_rejects_unreasonable_size() {
        let requested = 16;
        let mut backing = alloc_backing(total_size(requested, 1));
        let base = backing.as_mut_ptr();
        unsafe {
            install(
                base,
                requested,
                1,
                std::ptr::null(),
                #[cfg(feature = "statistics")]
                0,
            );
            assert!(scan_candidate(base, 4).is_none());
            assert!(scan_candidate(base, 1024).is_some());
        }
    }
}
