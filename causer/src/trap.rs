//! Component G: the async-signal trap handler and benign-access whitelist.
//!
//! Installed as the `SIGTRAP` (see `config::WP_SIGNAL`) handler for the
//! process. Everything here runs on the thread that happened to touch a
//! watched redzone byte, with that thread's normal execution suspended —
//! no locks that could be held by a thread this signal could itself
//! interrupt, no allocation through the shimmed allocator. Grounded
//! directly in the original `watchpoint::trapHandler`/`checkGlibcWL`.

use crate::config::LD_STRCMP_PROBE_OFFSET;
use crate::guard::Violation;
use crate::process_map::{Class, ProcessMap};
use std::ffi::CStr;
use std::os::raw::c_void;

extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: libc::c_int) -> libc::c_int;
}

const MAX_FRAMES: usize = 256;

/// Ranges of glibc string-function code known to probe one byte past the
/// end of a buffer as part of word-at-a-time scanning (`strcmp`, `strlen`,
/// `strchr`, SSE2/SSE4.2 variants...). An instruction pointer landing in one
/// of these, at the exact offset recorded here, is not a real overflow.
/// Offsets are relative to the mapping's load base and are brittle across
/// glibc builds by construction — this is exactly the original's tradeoff,
/// carried over rather than "fixed".
const GLIBC_WHITELIST_RANGES: &[(u64, u64)] = &[
    (0x13f5c9, 0x141434),
    (0x89cce, 0x8bb70),
    (0x86e07, 0x87f38),
    (0x88a7f, 0x88dfc),
    (0x9fcbe, 0x9fcf5),
    (0x9fcfa, 0x9feac),
    (0x145310, 0x14a467),
    (0x89a77, 0x93c24),
    (0xa1211, 0xa149f),
    (0xa9201, 0xa922c),
    (0xa7948, 0xa7948),
    (0xa79cd, 0xa79f3),
    (0xa67a0, 0xa69a0),
    (0x4e4b4, 0x4e4b4),
    (0xf6eb5, 0xf6eb5),
];

fn offset_is_whitelisted(offset: u64) -> bool {
    GLIBC_WHITELIST_RANGES.iter().any(|&(lo, hi)| offset >= lo && offset <= hi)
}

/// Symbol names (matched as substrings, the way `checkGlibcWL` does against
/// `Dl_info::dli_sname`) known to walk past a buffer's nominal end as part
/// of their own optimized, word-at-a-time implementation.
const WHITELISTED_SYMBOL_SUBSTRINGS: &[&str] = &["strrchr", "memchr", "xstat64"];

fn symbol_is_whitelisted(ip: u64) -> bool {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(ip as *const c_void, &mut info) } == 0 || info.dli_sname.is_null() {
        return false;
    }
    let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
    WHITELISTED_SYMBOL_SUBSTRINGS.iter().any(|s| name.contains(s))
}

/// The dynamic loader probes memory the same way libc's string functions do
/// (e.g. comparing `LD_LIBRARY_PATH` entries), but its code is relocated on
/// every run and not worth whitelisting by offset; any access inside it is
/// unconditionally benign, mirroring `trapHandler`'s blanket `ld-linux`
/// check.
fn is_loader_file(file: &str) -> bool {
    file.contains("ld-linux") || file.contains("/lib/ld-")
}

#[derive(Debug, PartialEq, Eq)]
pub enum TrapClassification {
    /// A known-benign libc internal probing one byte past a buffer; not a
    /// real application overflow.
    Benign,
    /// A genuine access to the redzone from application or unclassified
    /// code; `frames[skip..]` is the usable unwound stack for reporting.
    Real { skip: usize },
}

/// Capture the raw backtrace and classify the access that triggered the
/// trap. `fault_ip` is the faulting instruction's address
/// (`uc_mcontext.gregs[REG_RIP]` on the original); `maps` must already be
/// loaded (it is refreshed lazily, never inside the handler itself).
///
/// # Safety
/// Must only be called from within the `SIGTRAP` handler on the thread
/// that actually took the trap; relies on stack unwind via `backtrace(3)`.
pub unsafe fn classify(fault_ip: u64, maps: &ProcessMap) -> (TrapClassification, [u64; MAX_FRAMES], usize) {
    let (class, loc) = maps.classify(fault_ip);
    if let Some((file, _)) = loc {
        if is_loader_file(file) {
            return (TrapClassification::Benign, [0; MAX_FRAMES], 0);
        }
    }
    if class == Class::Libc {
        if let Some((_, offset)) = loc {
            if offset != LD_STRCMP_PROBE_OFFSET as u64 && (offset_is_whitelisted(offset) || symbol_is_whitelisted(fault_ip)) {
                return (TrapClassification::Benign, [0; MAX_FRAMES], 0);
            }
        }
    }

    let mut raw = [std::ptr::null_mut::<c_void>(); MAX_FRAMES];
    let count = backtrace(raw.as_mut_ptr(), MAX_FRAMES as libc::c_int).max(0) as usize;
    let mut frames = [0u64; MAX_FRAMES];
    for (i, f) in raw.iter().take(count).enumerate() {
        frames[i] = *f as u64;
    }

    let mut it = 0usize;
    while it < count && maps.classify(frames[it]).0 == Class::Tool {
        it += 1;
    }
    if it < count && maps.classify(frames[it]).0 == Class::Pthread {
        it += 1;
    }

    if it < count {
        let frame_ip = frames[it];
        let (frame_class, frame_loc) = maps.classify(frame_ip);
        if let Some((file, _)) = frame_loc {
            if is_loader_file(file) {
                return (TrapClassification::Benign, frames, count);
            }
        }
        if frame_class == Class::Libc {
            if let Some((_, offset)) = frame_loc {
                if offset == LD_STRCMP_PROBE_OFFSET as u64 {
                    it += 1;
                } else if offset_is_whitelisted(offset) || symbol_is_whitelisted(frame_ip) {
                    return (TrapClassification::Benign, frames, count);
                }
            }
        }
    }

    (TrapClassification::Real { skip: it }, frames, count)
}

/// Direction of the detected access, determined by re-reading the watched
/// byte: if it still holds the tail sentinel the access was a read (an
/// over-read doesn't clobber the value it touched), otherwise a write
/// already landed. Mirrors `trapHandler`'s `isread` check.
pub fn direction(watched_addr: *const u64, tail_sentinel: u64) -> &'static str {
    if unsafe { watched_addr.read_volatile() } == tail_sentinel {
        "read"
    } else {
        "write"
    }
}

pub fn violation_kind_for_guard(v: &Violation) -> &'static str {
    match v {
        Violation::HeadCorrupted => "head sentinel corrupted",
        Violation::TailCorrupted => "tail sentinel corrupted",
    }
}

/// Write a line to stderr using only a raw `write(2)`, never the buffered
/// `std::io` machinery (which may allocate), so the handler stays safe to
/// run while the interrupted thread might itself be inside `malloc`.
pub fn signal_safe_eprint(msg: &str) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const c_void, msg.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_hits_known_strcmp_range() {
        assert!(offset_is_whitelisted(0x89cff));
        assert!(!offset_is_whitelisted(0x1));
    }

    #[test]
    fn loader_file_is_recognized_regardless_of_distro_naming() {
        assert!(is_loader_file("/lib64/ld-linux-x86-64.so.2"));
        assert!(is_loader_file("/lib/ld-2.31.so"));
        assert!(!is_loader_file("/usr/lib/x86_64-linux-gnu/libc.so.6"));
    }

    #[test]
    fn direction_reports_read_when_sentinel_intact() {
        let tail = 0xDADE_BABE_DADE_BABEu64;
        let val = tail;
        assert_eq!(direction(&val as *const u64, tail), "read");
    }

    #[test]
    fn direction_reports_write_when_sentinel_clobbered() {
        let tail = 0xDADE_BABE_DADE_BABEu64;
        let val = 0u64;
        assert_eq!(direction(&val as *const u64, tail), "write");
    }
}
