//! skbtrack userspace library
//!
//! Provides reusable components for configuring, loading and reading the
//! eBPF skb tracking program.

pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod kallsyms;
pub mod loader;
pub mod reaper;
pub mod types;

pub use collector::TimelineCollector;
pub use config::{ProbeSet, ProbeSpec, ResolvedProbe, TrackingConfigFile};
pub use events::EventProcessor;
pub use exporter::{ExporterType, JsonExporter, ReportExporter, TextExporter};
pub use kallsyms::Kallsyms;
pub use loader::ProbeLoader;
pub use reaper::Reaper;
pub use types::*;
