//! Shared constants for the skb tracking probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in map sizes, event layout and counters.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Maximum number of probed functions (keys of the configuration maps)
pub const PROBE_MAX: u32 = 128;

/// Maximum number of skbs tracked at the same time
pub const TRACKING_MAP_MAX: u32 = 8192;

/// Number of raw events the ring buffer can hold
pub const EVENTS_MAX: u32 = 512;

// ============================================================================
// Raw Event Layout
// ============================================================================

/// Total size of a raw event, size field included
pub const RAW_EVENT_SIZE: usize = 1024;

/// Room left for sections once the size field is removed
pub const RAW_EVENT_DATA_SIZE: usize = RAW_EVENT_SIZE - 2;

/// Size of a section header (owner, data type, size)
pub const SECTION_HEADER_SIZE: usize = 4;

// ============================================================================
// Section Owners (for SectionHeader.owner)
// ============================================================================

/// Common section: event timestamp
pub const SECTION_COMMON: u8 = 1;

/// Kernel section: probed symbol address
pub const SECTION_KERNEL: u8 = 2;

/// Skb tracking section: skb identity
pub const SECTION_SKB_TRACKING: u8 = 4;

/// Data type of every section currently emitted
pub const SECTION_DATA_TYPE_DEFAULT: u8 = 1;

// ============================================================================
// Probe Arguments
// ============================================================================

/// Number of kprobe argument registers made available to handlers
pub const PROBE_ARGS_MAX: i8 = 5;

/// Argument offset meaning "not available for this probe"
pub const ARG_UNAVAILABLE: i8 = -1;

/// Drop reason reported when the probe has no drop reason argument
/// (matches SKB_NOT_DROPPED_YET)
pub const DROP_REASON_NONE: u32 = 0;

// ============================================================================
// Reaper
// ============================================================================

/// Default age after which an untouched tracking entry is reclaimed (60s)
pub const DEFAULT_REAP_MAX_AGE_NS: u64 = 60_000_000_000;

/// Default reaper period in seconds
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Total number of probe invocations
pub const STAT_TOTAL_EVENTS: u32 = 0;

/// Invocations for a symbol with no probe configuration
pub const STAT_NO_CONFIG: u32 = 1;

/// Invocations where no skb could be retrieved from the arguments
pub const STAT_NO_SKB: u32 = 2;

/// Invocations where skb->head was unreadable or null
pub const STAT_NO_HEAD: u32 = 3;

/// Events lost because the ring buffer was full
pub const STAT_EVENT_RESERVE_FAILED: u32 = 4;

/// Tracking sections dropped for lack of room in the event
pub const STAT_SECTION_FULL: u32 = 5;

/// Events carrying a tracking section
pub const STAT_TRACKED: u32 = 6;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 7;

/// Human readable names of the counters, indexed by STAT_* value
pub const STAT_NAMES: [&str; MAX_STATS as usize] = [
    "total_events",
    "no_config",
    "no_skb",
    "no_head",
    "event_reserve_failed",
    "section_full",
    "tracked",
];
