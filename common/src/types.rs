//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

use crate::constants::TASK_COMM_LEN;

/// Record emitted by the `do_sys_openat2` kprobe
///
/// All integers are in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct OpenEvent {
    /// Thread ID (kernel pid)
    pub pid: u32,
    /// Thread group ID (userspace pid)
    pub tgid: u32,
    /// `bpf_ktime_get_ns` at probe entry
    pub timestamp_ns: u64,
    /// Command name, NUL padded
    pub comm: [u8; TASK_COMM_LEN],
}

impl OpenEvent {
    /// Schema string describing this layout field by field
    pub const SCHEMA: &'static str = "pid:u32,tgid:u32,ts_ns:u64,comm:str16";

    /// Size of one record on the wire
    pub const SIZE: usize = core::mem::size_of::<OpenEvent>();

    /// Build an event with `comm` copied and truncated to `TASK_COMM_LEN`
    pub fn new(pid: u32, tgid: u32, timestamp_ns: u64, comm: &[u8]) -> Self {
        let mut name = [0u8; TASK_COMM_LEN];
        let len = comm.len().min(TASK_COMM_LEN);
        name[..len].copy_from_slice(&comm[..len]);
        Self {
            pid,
            tgid,
            timestamp_ns,
            comm: name,
        }
    }

    /// View the record as the raw bytes the kernel writes
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with no padding (checked below), so every byte is initialised.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }
}

// Compile-time layout checks
// The schema string above relies on there being no padding
const _: () = {
    assert!(core::mem::size_of::<OpenEvent>() == 4 + 4 + 8 + TASK_COMM_LEN);
    assert!(core::mem::size_of::<OpenEvent>() % core::mem::align_of::<OpenEvent>() == 0);
};
