//! eBPF Skb Tracking Probe - Kernel Space Program
//!
//! A single generic kprobe, attached by the userspace loader to every
//! function of interest taking a `struct sk_buff *`. Each firing emits one
//! raw event to userspace, carrying the skb identity resolved by
//! `skbtrack_common::track_skb`.
//!
//! ## Architecture
//!
//! ```text
//! kprobe fires -> PROBE_CONFIG[ksym]     (argument positions)
//!                  |
//!                  v
//!              track_skb()  <-> TRACKING_CONFIG[ksym], TRACKING_MAP[head|skb]
//!                  |
//!                  v
//!              EVENTS ring buffer: [common][kernel][skb tracking]
//!                  |
//!                  v
//! Userspace    -> Rebuild per-skb timelines, reap stale TRACKING_MAP entries
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The compiled bytecode is then loaded by the userspace program.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod skb;

// Re-export kprobe functions so they're visible to the loader
pub use handlers::probe_kprobe;

// Re-export maps for verification
pub use maps::{EVENTS, PROBE_CONFIG, STATS, TRACKING_CONFIG, TRACKING_MAP};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - this should never be reached
    // The verifier should catch any potential panics
    loop {}
}
