//! Helper functions for eBPF programs
//!
//! Provides safe wrappers around BPF helper functions and
//! utility functions for common operations.

use aya_ebpf::{
    helpers::{bpf_get_func_ip, bpf_ktime_get_ns},
    programs::ProbeContext,
    EbpfContext,
};

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Address of the probed function
///
/// This is the only common way of knowing where a probe is running, as the
/// same program is attached to every probed function.
#[inline(always)]
pub fn get_func_ip(ctx: &ProbeContext) -> u64 {
    unsafe { bpf_get_func_ip(ctx.as_ptr()) }
}

/// Increment a statistics counter
///
/// Safely increments a counter in the STATS map.
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    use crate::maps::STATS;

    unsafe {
        if let Some(count) = STATS.get(&stat_id) {
            let new_count = *count + 1;
            let _ = STATS.insert(&stat_id, &new_count, 0);
        } else {
            let _ = STATS.insert(&stat_id, &1u64, 0);
        }
    }
}
