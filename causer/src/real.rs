//! Real (un-intercepted) libc symbols, resolved once via
//! `dlsym(RTLD_NEXT, ...)`. Grounded in the original `real.hh`/`real.cpp`'s
//! `DECLARE_WRAPPER`/`DEFINE_WRAPPER`/`INIT_WRAPPER` macro trio — the Rust
//! shape trades macros for a single struct of function pointers resolved
//! in one pass, since Rust has no preprocessor token-pasting to lean on.

use crate::error::{Error, Result};
use std::ffi::{c_int, c_void, CStr};
use std::sync::OnceLock;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
type MallocUsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;
type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut c_void) -> *mut c_void,
    *mut c_void,
) -> c_int;

pub struct RealSymbols {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub memalign: MemalignFn,
    pub posix_memalign: PosixMemalignFn,
    pub malloc_usable_size: MallocUsableSizeFn,
    pub pthread_create: PthreadCreateFn,
}

static REAL: OnceLock<RealSymbols> = OnceLock::new();

unsafe fn resolve<T: Copy>(name: &str) -> Result<T> {
    let cname = std::ffi::CString::new(name).expect("symbol name has no interior NUL");
    let sym = libc::dlsym(libc::RTLD_NEXT, cname.as_ptr());
    if sym.is_null() {
        return Err(Error::BootstrapFailed(
            Box::leak(name.to_string().into_boxed_str()),
            dlerror_string(),
        ));
    }
    // SAFETY: caller guarantees `T` is a function-pointer-shaped type of
    // the correct ABI for `name`; dlsym hands back a raw code pointer.
    Ok(std::mem::transmute_copy::<*mut c_void, T>(&sym))
}

fn dlerror_string() -> String {
    unsafe {
        let p = libc::dlerror();
        if p.is_null() {
            "unknown dlsym failure".to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

/// Resolve every real symbol this crate needs. Must run before any guarded
/// allocation is attempted; the bootstrap allocator (`bootstrap.rs`) serves
/// allocations made during this call itself.
pub fn init() -> Result<()> {
    if REAL.get().is_some() {
        return Ok(());
    }
    let symbols = unsafe {
        RealSymbols {
            malloc: resolve("malloc")?,
            free: resolve("free")?,
            calloc: resolve("calloc")?,
            realloc: resolve("realloc")?,
            memalign: resolve("memalign")?,
            posix_memalign: resolve("posix_memalign")?,
            malloc_usable_size: resolve("malloc_usable_size")?,
            pthread_create: resolve("pthread_create")?,
        }
    };
    let _ = REAL.set(symbols);
    Ok(())
}

pub fn get() -> &'static RealSymbols {
    REAL.get().expect("real::init() must run before real::get()")
}

/// Whether [`init`] has finished resolving every real symbol. `dlsym` can
/// itself allocate while resolving a later symbol in the list; shims must
/// check this before calling [`get`] to avoid racing their own bootstrap.
pub fn is_initialized() -> bool {
    REAL.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlerror_string_has_a_fallback() {
        // Just exercises the no-pending-error path without requiring an
        // actual failed dlsym call in the test harness.
        let s = dlerror_string();
        assert!(!s.is_empty());
    }
}
