//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

use crate::constants::{ARG_UNAVAILABLE, PROBE_ARGS_MAX, RAW_EVENT_DATA_SIZE};

/// Behavior hints for a probed function
///
/// Indexed in the TRACKING_CONFIG map by the function address. Functions
/// without an entry are generic and get the default (all false).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Function frees the skb (non-zero for true)
    pub free: u8,
    /// Function changes skb->head to a value we can't predict (non-zero for true)
    pub inv_head: u8,
}

impl TrackingConfig {
    pub const fn new(free: bool, inv_head: bool) -> Self {
        Self {
            free: free as u8,
            inv_head: inv_head as u8,
        }
    }

    #[inline(always)]
    pub fn frees(&self) -> bool {
        self.free != 0
    }

    #[inline(always)]
    pub fn invalidates_head(&self) -> bool {
        self.inv_head != 0
    }
}

/// Position of the typed arguments in the probed function signature
///
/// A value of ARG_UNAVAILABLE (-1) means the function has no such argument.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeOffsets {
    /// Index of the `struct sk_buff *` argument
    pub sk_buff: i8,
    /// Index of the `enum skb_drop_reason` argument
    pub skb_drop_reason: i8,
}

impl Default for ProbeOffsets {
    fn default() -> Self {
        Self {
            sk_buff: ARG_UNAVAILABLE,
            skb_drop_reason: ARG_UNAVAILABLE,
        }
    }
}

/// Typed arguments a probe handler may ask for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeArg {
    SkBuff,
    SkbDropReason,
}

impl ProbeOffsets {
    /// Register index of `arg`, if it is valid for this probe
    #[inline(always)]
    pub fn index(&self, arg: ProbeArg) -> Option<usize> {
        let offset = match arg {
            ProbeArg::SkBuff => self.sk_buff,
            ProbeArg::SkbDropReason => self.skb_drop_reason,
        };

        if offset >= 0 && offset < PROBE_ARGS_MAX {
            Some(offset as usize)
        } else {
            None
        }
    }
}

/// Per-probe configuration, indexed in PROBE_CONFIG by the function address
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeConfig {
    pub offsets: ProbeOffsets,
}

/// Tracking information for a known skb
///
/// Stored in TRACKING_MAP under the skb data address (skb->head), and
/// temporarily under the skb address itself while the head is being
/// replaced. The tuple (orig_head, timestamp) uniquely identifies an skb.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackingInfo {
    /// When the skb was first seen (nanoseconds)
    pub timestamp: u64,
    /// When the skb was last seen (nanoseconds)
    pub last_seen: u64,
    /// Head address at first sight; never changes afterwards
    pub orig_head: u64,
}

impl TrackingInfo {
    #[inline(always)]
    pub fn new(head: u64, now: u64) -> Self {
        Self {
            timestamp: now,
            last_seen: now,
            orig_head: head,
        }
    }
}

/// Skb tracking section payload
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkbTrackingEvent {
    /// Head address at first sight
    pub orig_head: u64,
    /// When the skb was first seen (nanoseconds)
    pub timestamp: u64,
    /// Address of the skb itself
    pub skb: u64,
    /// Drop reason, DROP_REASON_NONE when unavailable
    pub drop_reason: u32,
}

/// Common section payload
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommonEvent {
    /// Probe invocation time (nanoseconds, CLOCK_MONOTONIC)
    pub timestamp: u64,
}

/// Kernel section payload
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelEvent {
    /// Address of the probed function
    pub symbol: u64,
}

/// Header preceding every section of a raw event
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section owner (see SECTION_* constants)
    pub owner: u8,
    /// Owner specific data type
    pub data_type: u8,
    /// Payload size, header excluded
    pub size: u16,
}

/// Raw event as written to the EVENTS ring buffer
///
/// `data` holds `size` bytes of back to back sections.
#[repr(C)]
pub struct RawEvent {
    pub size: u16,
    pub data: [u8; RAW_EVENT_DATA_SIZE],
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<TrackingInfo>() == 24);
    assert!(core::mem::size_of::<SkbTrackingEvent>() == 28);
    assert!(core::mem::size_of::<SectionHeader>() == crate::constants::SECTION_HEADER_SIZE);
    assert!(core::mem::size_of::<RawEvent>() == crate::constants::RAW_EVENT_SIZE);
    assert!(core::mem::size_of::<ProbeConfig>() % core::mem::align_of::<ProbeConfig>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for map access from userspace
    unsafe impl aya::Pod for TrackingConfig {}
    unsafe impl aya::Pod for ProbeConfig {}
    unsafe impl aya::Pod for TrackingInfo {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_outside_register_window_are_unavailable() {
        let offsets = ProbeOffsets {
            sk_buff: 2,
            skb_drop_reason: ARG_UNAVAILABLE,
        };
        assert_eq!(offsets.index(ProbeArg::SkBuff), Some(2));
        assert_eq!(offsets.index(ProbeArg::SkbDropReason), None);

        let offsets = ProbeOffsets {
            sk_buff: PROBE_ARGS_MAX,
            skb_drop_reason: 1,
        };
        assert_eq!(offsets.index(ProbeArg::SkBuff), None);
        assert_eq!(offsets.index(ProbeArg::SkbDropReason), Some(1));
    }

    #[test]
    fn tracking_config_flags() {
        let cfg = TrackingConfig::new(true, false);
        assert!(cfg.frees());
        assert!(!cfg.invalidates_head());
        assert_eq!(TrackingConfig::default(), TrackingConfig::new(false, false));
    }
}
