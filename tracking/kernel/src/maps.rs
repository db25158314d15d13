//! BPF map definitions for skb tracking
//!
//! Defines the maps shared with userspace, and the store views handed to
//! the identity resolution.

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    macros::map,
    maps::{HashMap, RingBuf},
};
use skbtrack_common::{constants::*, types::*, ConfigStore, TrackingStore};

/// Behavior hints of special functions
///
/// Key: function address
/// Value: TrackingConfig (frees the skb, invalidates its head)
///
/// Filled by userspace before any probe is attached, read-only afterwards.
#[map]
pub static TRACKING_CONFIG: HashMap<u64, TrackingConfig> =
    HashMap::with_max_entries(PROBE_MAX, 0);

/// Argument positions of every probed function
///
/// Key: function address
/// Value: ProbeConfig
///
/// Invocations for addresses missing here are ignored.
#[map]
pub static PROBE_CONFIG: HashMap<u64, ProbeConfig> =
    HashMap::with_max_entries(PROBE_MAX, 0);

/// Known skbs
///
/// Key: skb->head, or the skb address while its head is being replaced
/// Value: TrackingInfo
///
/// Insertions fail once full; stale entries are reclaimed by userspace
/// using TrackingInfo.last_seen.
#[map]
pub static TRACKING_MAP: HashMap<u64, TrackingInfo> =
    HashMap::with_max_entries(TRACKING_MAP_MAX, 0);

/// Ring buffer of raw events sent to userspace
#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(RAW_EVENT_SIZE as u32 * EVENTS_MAX, 0);

/// Statistics counter map
///
/// Tracks various statistics for monitoring probe health.
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static STATS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_STATS, 0);

/// TRACKING_CONFIG seen as a behavior configuration store
pub struct KernelConfigStore;

impl ConfigStore for KernelConfigStore {
    #[inline(always)]
    fn lookup(&self, ksym: u64) -> Option<TrackingConfig> {
        unsafe { TRACKING_CONFIG.get(&ksym).copied() }
    }
}

/// TRACKING_MAP seen as a tracking store
pub struct KernelTrackingStore;

impl TrackingStore for KernelTrackingStore {
    #[inline(always)]
    fn lookup(&self, key: u64) -> Option<TrackingInfo> {
        unsafe { TRACKING_MAP.get(&key).copied() }
    }

    #[inline(always)]
    fn insert_if_absent(&self, key: u64, info: &TrackingInfo) -> bool {
        // Fails with -EEXIST when present, -E2BIG when full.
        TRACKING_MAP.insert(&key, info, BPF_NOEXIST as u64).is_ok()
    }

    #[inline(always)]
    fn delete(&self, key: u64) {
        let _ = TRACKING_MAP.remove(&key);
    }

    #[inline(always)]
    fn touch(&self, key: u64, now: u64) -> bool {
        match TRACKING_MAP.get_ptr_mut(&key) {
            Some(info) => {
                unsafe { (*info).last_seen = now };
                true
            }
            None => false,
        }
    }
}
