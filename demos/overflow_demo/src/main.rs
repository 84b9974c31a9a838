//! Manual exercise harness, not a test binary: build and run it with
//! `LD_PRELOAD=target/release/libcauser.so` to watch overflow reports fire
//! on stderr. Each scenario is named after the matching end-to-end scenario.
//!
//! Run:
//!   cargo build --release -p causer -p overflow_demo
//!   LD_PRELOAD=target/release/libcauser.so target/release/overflow_demo

use std::ffi::{c_char, c_void};
use std::time::Duration;

extern "C" {
    fn malloc(size: usize) -> *mut c_void;
    fn free(ptr: *mut c_void);
    fn strlen(s: *const c_char) -> usize;
}

/// S1: allocate 16 bytes from this call site, then write one byte past the
/// end. The owning call site should be pinned to `R_cap` after the free.
fn overwrite() {
    unsafe {
        let p = malloc(16) as *mut u8;
        for i in 0..17u8 {
            p.add(i as usize).write(i);
        }
        println!("overwrite: wrote 17 bytes into a 16 byte object");
        free(p as *mut c_void);
    }
}

/// S2: allocate 4 bytes, read the byte immediately past the end. If a
/// watchpoint landed on this object, this fires an over-read report before
/// the read even retires.
fn over_read() {
    unsafe {
        let p = malloc(4) as *mut u8;
        p.write_bytes(0x41, 4);
        let leaked = p.add(4).read_volatile();
        println!("over_read: byte past the end was {leaked:#x}");
        free(p as *mut c_void);
    }
}

/// S3: a benign libc call (`strlen`) walking past a short allocation's
/// nominal end via an aligned word read. Should never produce a report —
/// the trap handler recognizes the instruction pointer as inside libc's
/// whitelisted string-function ranges.
fn benign_libc_probe() {
    unsafe {
        let p = malloc(6) as *mut u8;
        std::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), p, 6);
        let len = strlen(p as *const c_char);
        println!("benign_libc_probe: strlen reported {len}");
        free(p as *mut c_void);
    }
}

fn main() {
    println!("overflow_demo pid={}", std::process::id());
    overwrite();
    std::thread::sleep(Duration::from_millis(50));
    over_read();
    std::thread::sleep(Duration::from_millis(50));
    benign_libc_probe();
    println!("done");
}
