//! Kprobe handler for skb tracking
//!
//! Implements the eBPF program attached to every probed function. It never
//! reports a failure: whatever goes wrong, the probed function must not
//! notice the probe.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use skbtrack_common::{
    constants::*, track_skb, CommonEvent, EventSink, KernelEvent, Observation, RawEvent,
    TrackOutcome,
};

use crate::{
    helpers::*,
    maps::*,
    skb::{read_head, KprobeArgs},
};

/// Track an skb through a probed function
///
/// Attached to: every symbol configured by the loader
///
/// Emits one event made of a common section (timestamp), a kernel section
/// (probed function) and a skb tracking section (skb identity).
#[kprobe]
pub fn probe_kprobe(ctx: ProbeContext) -> u32 {
    match try_probe_kprobe(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_probe_kprobe(ctx: &ProbeContext) -> Result<u32, i64> {
    // Filled as early as possible, then left untouched.
    let timestamp = get_timestamp();
    let ksym = get_func_ip(ctx);

    increment_stat(STAT_TOTAL_EVENTS);

    let cfg = match unsafe { PROBE_CONFIG.get(&ksym) } {
        Some(cfg) => *cfg,
        None => {
            increment_stat(STAT_NO_CONFIG);
            return Ok(0);
        }
    };

    let args = KprobeArgs::new(ctx, cfg.offsets);
    let skb = match args.skb() {
        Ok(skb) => skb,
        Err(e) => {
            increment_stat(STAT_NO_SKB);
            return Err(e);
        }
    };
    let head = read_head(skb);

    let mut entry = match EVENTS.reserve::<RawEvent>(0) {
        Some(entry) => entry,
        None => {
            increment_stat(STAT_EVENT_RESERVE_FAILED);
            return Ok(0);
        }
    };

    // Only the size field needs initializing, sections are written in order.
    let event = unsafe {
        let event = &mut *entry.as_mut_ptr();
        event.reset();
        event
    };

    if !event.append_section(
        SECTION_COMMON,
        SECTION_DATA_TYPE_DEFAULT,
        &CommonEvent { timestamp },
    ) || !event.append_section(
        SECTION_KERNEL,
        SECTION_DATA_TYPE_DEFAULT,
        &KernelEvent { symbol: ksym },
    ) {
        entry.discard(0);
        return Ok(0);
    }

    let obs = Observation {
        ksym,
        timestamp,
        skb,
        head,
    };

    match track_skb(&KernelConfigStore, &KernelTrackingStore, &args, event, &obs) {
        TrackOutcome::NoHead => {
            increment_stat(STAT_NO_HEAD);
            entry.discard(0);
        }
        TrackOutcome::SectionFull => {
            increment_stat(STAT_SECTION_FULL);
            entry.submit(0);
        }
        TrackOutcome::Emitted => {
            increment_stat(STAT_TRACKED);
            entry.submit(0);
        }
    }

    Ok(0)
}
