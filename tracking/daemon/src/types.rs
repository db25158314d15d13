//! Userspace type definitions
//!
//! Defines the data structures used by the userspace program for
//! timeline reconstruction and export.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from skbtrack_common)
//! - **Userspace Types**: Types used only in userspace for aggregation and export

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the skbtrack-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use skbtrack_common::constants;
    pub use skbtrack_common::types::{
        ProbeConfig, ProbeOffsets, SkbTrackingEvent, TrackingConfig, TrackingInfo,
    };
}

pub use kernel::{ProbeConfig, TrackingConfig, TrackingInfo};

/// Unique identity of an skb: head address and time of first sight
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkbId {
    pub orig_head: u64,
    pub timestamp: u64,
}

/// Skb tracking section of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkbTracking {
    pub id: SkbId,
    /// Address of the skb at the time of the event
    pub skb: u64,
    /// Drop reason, DROP_REASON_NONE when unavailable
    pub drop_reason: u32,
}

/// A raw event once its sections are decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Probe invocation time (nanoseconds, CLOCK_MONOTONIC)
    pub timestamp: u64,
    /// Address of the probed function
    pub symbol: Option<u64>,
    /// Skb identity, missing if the section was dropped in the kernel
    pub tracking: Option<SkbTracking>,
}

/// Full report for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrackingReport {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Aggregated statistics
    pub summary: TrackingSummary,
    /// Per-skb timelines, ordered by first sight
    pub skbs: Vec<SkbTimeline>,
}

/// Aggregated statistics
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct TrackingSummary {
    /// Total number of events received
    pub total_events: u64,
    /// Events without a skb tracking section
    pub untracked_events: u64,
    /// Events that could not be decoded
    pub invalid_events: u64,
    /// Distinct skbs seen
    pub tracked_skbs: u64,
    /// Skbs whose free was observed
    pub completed_skbs: u64,
    /// Events per probed function
    pub events_by_function: BTreeMap<String, u64>,
    /// Events per drop reason (drop reason available only)
    pub drops_by_reason: BTreeMap<u32, u64>,
    /// Counters from the kernel STATS map
    pub kernel_counters: BTreeMap<String, u64>,
    /// Stale tracking entries removed by the reaper
    pub reaped_entries: u64,
}

/// Lifetime of a single skb
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SkbTimeline {
    /// Head address at first sight
    pub orig_head: String,
    /// When the skb was first seen (nanoseconds)
    pub created_at_ns: u64,
    /// When the skb was last seen (nanoseconds)
    pub last_seen_ns: u64,
    /// Skb addresses this skb was seen with
    pub skb_addresses: Vec<String>,
    /// A freeing function was observed
    pub freed: bool,
    /// Observations, in timestamp order
    pub events: Vec<TimelineEntry>,
}

/// One observation of an skb
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub timestamp_ns: u64,
    pub function: String,
    pub skb: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<u32>,
}

/// Format a kernel address the way kallsyms does
pub fn format_addr(addr: u64) -> String {
    format!("{:#018x}", addr)
}
