//! `causer`: an adaptive hardware-watchpoint buffer overflow detector.
//!
//! Injected into a host process via `LD_PRELOAD`. Every heap allocation is
//! wrapped with head/tail sentinels (`guard`), attributed to its call site
//! (`callsite`), and probabilistically given a hardware watchpoint on its
//! trailing redzone byte (`scheduler`/`watchpoints`) so overflows are
//! caught close to where they happen rather than at the next use of
//! corrupted data. See `trap` for the signal handler that fires when a
//! watchpoint trips and `history` for the cross-run persistence format.

pub mod bootstrap;
pub mod callsite;
pub mod config;
pub mod error;
pub mod guard;
pub mod history;
pub mod process_map;
pub mod real;
pub mod scheduler;
pub mod symbolication;
pub mod thread_registry;
pub mod trap;
pub mod watchpoints;

mod shim;

use scheduler::Scheduler;
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, RwLock};
use thread_registry::ThreadRegistry;

thread_local! {
    /// Reentrancy guard: set while this thread is inside `causer`'s own
    /// bookkeeping, so a `malloc` call made *by* that bookkeeping (string
    /// formatting, `Vec` growth, ...) passes straight through to the real
    /// allocator instead of being tracked again. Mirrors the original's
    /// `COND_DISABLE`/`COND_ENABLE`/`isCauser()` thread-local flag.
    static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

pub fn is_suppressed() -> bool {
    SUPPRESSED.with(|s| s.get())
}

struct Suppress;

impl Suppress {
    fn enter() -> Option<Self> {
        let already = SUPPRESSED.with(|s| s.replace(true));
        if already {
            None
        } else {
            Some(Suppress)
        }
    }
}

impl Drop for Suppress {
    fn drop(&mut self) {
        SUPPRESSED.with(|s| s.set(false));
    }
}

pub struct Core {
    pub scheduler: Scheduler,
    pub threads: ThreadRegistry,
    pub maps: RwLock<process_map::ProcessMap>,
    history_path: std::path::PathBuf,
}

static CORE: OnceLock<Core> = OnceLock::new();
static READY: AtomicBool = AtomicBool::new(false);

pub fn core() -> &'static Core {
    CORE.get().expect("causer::core() called before initialization")
}

pub fn is_ready() -> bool {
    READY.load(Ordering::Acquire)
}

fn tool_module_path() -> Option<String> {
    let probe = tool_module_path as usize as *const c_void;
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(probe, &mut info) } != 0 && !info.dli_fname.is_null() {
        let cstr = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) };
        return Some(cstr.to_string_lossy().into_owned());
    }
    None
}

fn history_path() -> std::path::PathBuf {
    let exe = std::env::current_exe().unwrap_or_else(|_| std::path::PathBuf::from("unknown"));
    let mut path = exe;
    let stem = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "unknown".into());
    path.set_file_name(format!("{stem}_callstack.info"));
    path
}

fn init() {
    if real::init().is_err() {
        trap::signal_safe_eprint("causer: failed to resolve real allocator symbols\n");
        return;
    }

    let maps = match process_map::ProcessMap::load(tool_module_path()) {
        Ok(m) => m,
        Err(_) => return,
    };

    let core = Core {
        scheduler: Scheduler::new(),
        threads: ThreadRegistry::new(),
        maps: RwLock::new(maps),
        history_path: history_path(),
    };

    if let Ok(idx) = core.threads.alloc() {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        core.threads.mark_started(idx, tid, current_frame_pointer());
    }

    {
        let maps = core.maps.read().expect("process map lock poisoned");
        let _ = history::load(&core.history_path, &core.scheduler.callsites, &maps);
    }

    let _ = CORE.set(core);
    install_trap_handler();
    READY.store(true, Ordering::Release);
}

fn fini() {
    if !is_ready() {
        return;
    }
    let core = core();
    let maps = core.maps.read().expect("process map lock poisoned");
    if let Err(e) = history::save(&core.history_path, &core.scheduler.callsites, &maps) {
        eprintln!("causer: failed to save history: {e}");
    }
    #[cfg(feature = "scan-memory")]
    scan_all_memory(core, &maps);
}

/// End-of-run sweep over every writable data mapping looking for objects
/// whose watchpoint was never armed (no free slot, preemption lost) but
/// still carry a live guard. Mirrors `checkAllMemory`: scan word-aligned
/// candidates for the head sentinel, reconstruct the guard assuming the
/// ordinary (non-`memalign`) footprint, and check the tail. Racy by
/// construction against the process tearing mappings down mid-scan; the
/// original accepts the same tradeoff since this only runs once at exit.
#[cfg(feature = "scan-memory")]
fn scan_all_memory(core: &Core, maps: &process_map::ProcessMap) {
    const WORD: u64 = std::mem::size_of::<u64>() as u64;
    const MAX_REASONABLE_OBJECT_SIZE: usize = 64 * 1024 * 1024;

    for region in maps.writable_data_regions() {
        let mut addr = region.start;
        while addr + guard::HEADER_SIZE as u64 <= region.end {
            let candidate = unsafe { guard::scan_candidate(addr as *mut u8, MAX_REASONABLE_OBJECT_SIZE) };
            if let Some((guarded, result)) = candidate {
                if let Err(violation) = result {
                    eprintln!(
                        "causer: end-of-run scan found object {:p} with a {}",
                        guarded.user_ptr,
                        trap::violation_kind_for_guard(&violation)
                    );
                    if !guarded.callsite_ptr.is_null() {
                        let record = unsafe { &*guarded.callsite_ptr };
                        core.scheduler.pin_overflowed(record);
                    }
                }
            }
            addr += WORD;
        }
    }
}

fn install_trap_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = trap_entry as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigaction(config::WP_SIGNAL, &action, std::ptr::null_mut());

        #[cfg(feature = "segv-handler")]
        {
            let mut segv_action: libc::sigaction = std::mem::zeroed();
            segv_action.sa_sigaction = segv_entry as usize;
            segv_action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_NODEFER;
            libc::sigaction(libc::SIGSEGV, &segv_action, std::ptr::null_mut());
            libc::sigaction(libc::SIGABRT, &segv_action, std::ptr::null_mut());
        }
    }
}

extern "C" fn trap_entry(_sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    if !is_ready() || is_suppressed() {
        return;
    }
    let _suppress = Suppress::enter();

    let fd = unsafe { (*info).si_fd() };
    let fault_ip = unsafe { ucontext_rip(ctx) };

    let core = core();
    let maps = core.maps.read().expect("process map lock poisoned");

    let (classification, frames, count) = unsafe { trap::classify(fault_ip, &maps) };
    let skip = match classification {
        trap::TrapClassification::Benign => return,
        trap::TrapClassification::Real { skip } => skip,
    };

    let Some((watch_addr, object_start, _object_size, record)) = core.scheduler.watchpoints.find_by_fd(fd) else {
        return;
    };

    const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
    const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    unsafe {
        libc::ioctl(fd, PERF_EVENT_IOC_DISABLE, 0);
    }
    let dir = trap::direction(watch_addr as *const u64, config::SENTINEL_TAIL_WORD);
    unsafe {
        libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0);
    }

    core.scheduler.pin_overflowed(&record);

    let mut msg = format!("*** buffer over-{dir} detected, object allocated at {object_start:#x} ***\n");
    msg.push_str("  allocation call stack:\n");
    for frame in record.fingerprint.frames() {
        msg.push_str(&format!("    at {frame:#x}\n"));
    }
    msg.push_str("  trapping access call stack:\n");
    for frame in frames.iter().take(count).skip(skip) {
        msg.push_str(&format!("    at {frame:#x}\n"));
    }
    trap::signal_safe_eprint(&msg);
}

#[cfg(feature = "segv-handler")]
extern "C" fn segv_entry(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let _suppress = Suppress::enter();
    let ip = unsafe { ucontext_rip(ctx) };
    trap::signal_safe_eprint(&format!("*** crash site ip {ip:#x} ***\n"));
    unsafe { libc::_exit(1) };
}

unsafe fn ucontext_rip(ctx: *mut c_void) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        let ctx = ctx as *mut libc::ucontext_t;
        (*ctx).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ctx;
        0
    }
}

fn current_frame_pointer() -> u64 {
    let mut fp: u64;
    unsafe {
        std::arch::asm!("mov {}, rbp", out(reg) fp);
    }
    fp
}

extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: libc::c_int) -> libc::c_int;
}

/// Capture the call stack for a just-made allocation, skipping frames that
/// land inside this library itself. Mirrors `causer::getCallsites`.
pub(crate) fn capture_callsite_frames() -> Vec<u64> {
    const MAX: usize = config::MAX_CALLSTACK_DEPTH + 8;
    let mut raw = [std::ptr::null_mut::<c_void>(); MAX];
    let count = unsafe { backtrace(raw.as_mut_ptr(), MAX as libc::c_int) }.max(0) as usize;

    let maps = core().maps.read().expect("process map lock poisoned");
    let mut it = 0;
    while it < count && maps.classify(raw[it] as u64).0 == process_map::Class::Tool {
        it += 1;
    }

    let mut frames = Vec::with_capacity(config::MAX_CALLSTACK_DEPTH);
    let mut prev = 0u64;
    for &f in raw.iter().take(count).skip(it) {
        let addr = f as u64;
        if addr == prev {
            continue;
        }
        frames.push(addr);
        prev = addr;
        if frames.len() >= config::MAX_CALLSTACK_DEPTH {
            break;
        }
    }
    frames
}

#[ctor::ctor]
fn on_load() {
    init();
}

#[ctor::dtor]
fn on_unload() {
    fini();
}
