//! C ABI allocator and `pthread_create` shims exported from the `cdylib`.
//! `LD_PRELOAD` makes these resolve ahead of libc's own definitions for
//! every other module in the host process. Each shim does only enough
//! bookkeeping to keep `core()`'s bookkeeping consistent and forwards the
//! real work to `real::get()`; all the interesting policy lives in
//! `scheduler`/`watchpoints`/`guard`. Grounded in the original
//! `gnuwrapper.cpp`'s thin `malloc`/`free`/... wrapper functions.

use crate::guard;
use crate::{bootstrap, capture_callsite_frames, core, is_ready, real, Suppress};
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};

unsafe fn guarded_alloc(requested: usize) -> *mut c_void {
    if !real::is_initialized() {
        // dlsym itself may allocate while real::init() is still resolving a
        // later symbol; there is no real malloc to forward to yet.
        return bootstrap::alloc(requested, 16).map_or(std::ptr::null_mut(), |p| p as *mut c_void);
    }
    if !is_ready() || crate::is_suppressed() {
        let real = real::get();
        return (real.malloc)(requested);
    }
    let Some(_suppress) = Suppress::enter() else {
        return (real::get().malloc)(requested);
    };

    let frames = capture_callsite_frames();
    let record = core().scheduler.resolve_callsite(&frames);

    let total = guard::total_size(requested, 1);
    let base = (real::get().malloc)(total) as *mut u8;
    if base.is_null() {
        return std::ptr::null_mut();
    }

    #[cfg(feature = "statistics")]
    let alloc_index = NEXT_ALLOC_INDEX.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let guarded = guard::install(
        base,
        requested,
        1,
        std::sync::Arc::as_ptr(&record),
        #[cfg(feature = "statistics")]
        alloc_index,
    );

    core().scheduler.start_watch(guarded.user_ptr as u64, requested, record, &core().threads);

    guarded.user_ptr as *mut c_void
}

#[cfg(feature = "statistics")]
static NEXT_ALLOC_INDEX: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

unsafe fn guarded_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if bootstrap::owns(ptr as *const u8) {
        return;
    }
    if !is_ready() || crate::is_suppressed() {
        (real::get().free)(ptr);
        return;
    }
    let Some(_suppress) = Suppress::enter() else {
        (real::get().free)(ptr);
        return;
    };

    let guarded = guard::from_user_ptr(ptr as *mut u8);

    #[cfg(feature = "evidence")]
    {
        if let Err(violation) = guard::check(&guarded) {
            eprintln!(
                "causer: object {:p} freed with a {}",
                guarded.user_ptr,
                crate::trap::violation_kind_for_guard(&violation)
            );
            if !guarded.callsite_ptr.is_null() {
                // SAFETY: callsite_ptr points into a CallsiteTable record,
                // never removed once added, so it outlives every guarded
                // allocation made at that site.
                let record = &*guarded.callsite_ptr;
                core().scheduler.pin_overflowed(record);
            }
        }
    }

    core().scheduler.stop_watch(guarded.user_ptr as u64, &core().threads);
    (real::get().free)(guarded.base as *mut c_void);
}

/// # Safety
/// Standard C `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    guarded_alloc(size)
}

/// # Safety
/// Standard C `free` contract.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    guarded_free(ptr)
}

/// # Safety
/// Standard C `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        return std::ptr::null_mut();
    };
    let ptr = guarded_alloc(total);
    if !ptr.is_null() {
        std::ptr::write_bytes(ptr as *mut u8, 0, total);
    }
    ptr
}

/// # Safety
/// Standard C `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return guarded_alloc(size);
    }
    if size == 0 {
        guarded_free(ptr);
        return std::ptr::null_mut();
    }

    let old_guarded = guard::from_user_ptr(ptr as *mut u8);
    let old_size = old_guarded.requested_size;
    let new_ptr = guarded_alloc(size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    std::ptr::copy_nonoverlapping(ptr as *const u8, new_ptr as *mut u8, old_size.min(size));
    guarded_free(ptr);
    new_ptr
}

/// # Safety
/// Standard C `memalign` contract. The guard footprint ahead of the user
/// pointer is itself rounded up to a multiple of `alignment`, so the
/// returned pointer honors the caller's alignment request the same way the
/// original's `xxmemalign` does: round `objguardsize` up first, then place
/// the object immediately after it.
#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !real::is_initialized() {
        return bootstrap::alloc(size, alignment.max(1)).map_or(std::ptr::null_mut(), |p| p as *mut c_void);
    }
    if !is_ready() || crate::is_suppressed() {
        return (real::get().memalign)(alignment, size);
    }
    let Some(_suppress) = Suppress::enter() else {
        return (real::get().memalign)(alignment, size);
    };

    let frames = capture_callsite_frames();
    let record = core().scheduler.resolve_callsite(&frames);

    let alignment = alignment.max(1);
    let total = guard::total_size(size, alignment);
    let base = (real::get().memalign)(alignment, total) as *mut u8;
    if base.is_null() {
        return std::ptr::null_mut();
    }
    let guarded = guard::install(
        base,
        size,
        alignment,
        std::sync::Arc::as_ptr(&record),
        #[cfg(feature = "statistics")]
        0,
    );
    core().scheduler.start_watch(guarded.user_ptr as u64, size, record, &core().threads);
    guarded.user_ptr as *mut c_void
}

/// # Safety
/// Standard C `posix_memalign` contract.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> c_int {
    let ptr = memalign(alignment, size);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    *memptr = ptr;
    0
}

/// # Safety
/// Standard C `aligned_alloc` contract.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    memalign(alignment, size)
}

/// # Safety
/// Standard C `valloc`/`pvalloc` contract: page-aligned allocation.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let page = libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize;
    memalign(page, size)
}

/// # Safety
/// Standard C `pvalloc` contract: page-aligned, rounded up to a page.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page = libc::sysconf(libc::_SC_PAGESIZE).max(4096) as usize;
    let rounded = (size + page - 1) & !(page - 1);
    memalign(page, rounded)
}

/// # Safety
/// Standard C `malloc_usable_size` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() || bootstrap::owns(ptr as *const u8) {
        return (real::get().malloc_usable_size)(ptr);
    }
    guard::from_user_ptr(ptr as *mut u8).requested_size
}

/// # Safety
/// Standard C `strdup` contract.
#[no_mangle]
pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let len = libc::strlen(s);
    let out = guarded_alloc(len + 1) as *mut c_char;
    if !out.is_null() {
        std::ptr::copy_nonoverlapping(s, out, len + 1);
    }
    out
}

/// # Safety
/// Standard C `strndup` contract.
#[no_mangle]
pub unsafe extern "C" fn strndup(s: *const c_char, n: usize) -> *mut c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let max_len = libc::strnlen(s, n);
    let out = guarded_alloc(max_len + 1) as *mut c_char;
    if !out.is_null() {
        std::ptr::copy_nonoverlapping(s, out, max_len);
        *out.add(max_len) = 0;
    }
    out
}

struct ThreadTrampolineArg {
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    start_arg: *mut c_void,
    index: usize,
}

unsafe impl Send for ThreadTrampolineArg {}

extern "C" fn thread_trampoline(arg: *mut c_void) -> *mut c_void {
    let arg = unsafe { Box::from_raw(arg as *mut ThreadTrampolineArg) };
    core().threads.adopt(arg.index);
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    core().threads.mark_started(arg.index, tid, 0);

    core().scheduler.watchpoints.arm_for_new_thread(arg.index, tid);

    let result = (arg.start_routine)(arg.start_arg);

    core().scheduler.watchpoints.disarm_thread(arg.index);
    core().threads.release(arg.index);
    result
}

/// # Safety
/// Standard C `pthread_create` contract.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> c_int {
    if !is_ready() {
        return (real::get().pthread_create)(thread, attr, start_routine, arg);
    }

    let Ok(index) = core().threads.alloc() else {
        return libc::EAGAIN;
    };

    let trampoline_arg = Box::into_raw(Box::new(ThreadTrampolineArg {
        start_routine,
        start_arg: arg,
        index,
    }));

    let result = (real::get().pthread_create)(thread, attr, thread_trampoline, trampoline_arg as *mut c_void);
    if result != 0 {
        core().threads.release(index);
        drop(Box::from_raw(trampoline_arg));
    }
    result
}
