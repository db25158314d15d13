//! Shared types and skb identity tracking for the skbtrack probes
//!
//! This crate provides the data structures and constants shared between the
//! eBPF kernel program and the userspace daemon, the raw event section
//! writer, and the skb identity resolution run by every probe.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod event;
pub mod tracking;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use event::EventSink;
pub use tracking::{
    track_skb, ConfigStore, Observation, ProbeArgs, TrackOutcome, TrackingStore,
};
pub use types::{
    CommonEvent, KernelEvent, ProbeArg, ProbeConfig, ProbeOffsets, RawEvent, SectionHeader,
    SkbTrackingEvent, TrackingConfig, TrackingInfo,
};
