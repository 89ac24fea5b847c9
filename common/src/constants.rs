//! Shared constants for kprobe programs
//!
//! These constants are used by both kernel and userspace programs
//! so the two sides agree on names, layouts and defaults.

// ============================================================================
// Probe Defaults
// ============================================================================

/// Kernel function instrumented when no symbol is configured
pub const DEFAULT_TARGET_SYMBOL: &str = "do_sys_openat2";

/// Name of the kprobe program inside the BPF object
pub const DEFAULT_PROGRAM_NAME: &str = "hello_world";

/// Name of the perf event array the kprobe program writes records to
pub const EVENTS_MAP_NAME: &str = "EVENTS";

/// Text output of `bpf_trace_printk`
pub const TRACE_PIPE_PATH: &str = "/sys/kernel/debug/tracing/trace_pipe";

// ============================================================================
// Event Channel
// ============================================================================

/// Default number of slots in the userspace event channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Largest slot a channel will allocate (bytes)
pub const MAX_SLOT_SIZE: usize = 4096;

/// Slot width used for one line of trace_pipe text
pub const TRACE_PIPE_LINE_WIDTH: usize = 256;

// ============================================================================
// Delivery Loop
// ============================================================================

/// Default time a single channel poll may block (milliseconds)
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Default time allowed for draining buffered records on shutdown (milliseconds)
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 500;

/// Consecutive perf read failures after which a CPU feed gives up
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

// ============================================================================
// Record Layout
// ============================================================================

/// Length of `task_struct::comm`
pub const TASK_COMM_LEN: usize = 16;
