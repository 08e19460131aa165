//! Kernel-header constant compatibility table
//!
//! Socket options and memory-accounting quanta vary by kernel version and are
//! defined in C headers the daemon never sees. They are collected here in one
//! versioned table rather than being hardcoded in tuner logic.

/// `SO_SNDBUF` socket option
pub const SO_SNDBUF: i32 = 7;
/// `SO_RCVBUF` socket option
pub const SO_RCVBUF: i32 = 8;
/// `SO_NETNS_COOKIE` socket option (kernel >= 5.14)
pub const SO_NETNS_COOKIE: i32 = 71;
/// `SOCK_SNDBUF_LOCK` userlock bit
pub const SOCK_SNDBUF_LOCK: i32 = 1;
/// `SOCK_RCVBUF_LOCK` userlock bit
pub const SOCK_RCVBUF_LOCK: i32 = 2;
/// Socket memory accounting quantum (`SK_MEM_QUANTUM`)
pub const SK_MEM_QUANTUM: i64 = 4096;

/// Runtime-detected kernel parameters used to seed probe globals
#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub page_size: i64,
    pub page_shift: u32,
    pub sk_mem_quantum: i64,
    pub sk_mem_quantum_shift: u32,
}

impl KernelParams {
    /// Detect parameters for the running kernel
    pub fn detect() -> Self {
        // SAFETY: sysconf is always safe to call.
        let mut page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            page_size = 4096;
        }
        Self {
            page_size,
            page_shift: ilog2(page_size),
            sk_mem_quantum: SK_MEM_QUANTUM,
            sk_mem_quantum_shift: ilog2(SK_MEM_QUANTUM),
        }
    }
}

/// Integer base-2 logarithm, matching the kernel's `ilog2` for powers of two
pub fn ilog2(v: i64) -> u32 {
    debug_assert!(v > 0);
    63 - (v as u64).leading_zeros()
}
