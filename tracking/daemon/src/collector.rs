//! Timeline collection and aggregation
//!
//! Groups events by skb identity `(orig_head, timestamp)` to rebuild the
//! lifetime of every skb, and computes statistics.

use crate::{config::ResolvedProbe, types::*};
use skbtrack_common::constants::DROP_REASON_NONE;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Events of a single skb, as collected
#[derive(Debug, Default)]
struct TimelineState {
    last_seen: u64,
    skbs: Vec<u64>,
    freed: bool,
    entries: Vec<TimelineEntry>,
}

/// Timeline collector for aggregating tracking events
#[derive(Default)]
pub struct TimelineCollector {
    /// Probed function names by address
    functions: HashMap<u64, String>,
    /// Addresses of functions freeing skbs
    freeing: HashSet<u64>,
    /// Timelines by skb identity
    timelines: HashMap<SkbId, TimelineState>,
    events_by_function: BTreeMap<String, u64>,
    drops_by_reason: BTreeMap<u32, u64>,
    total_events: u64,
    untracked_events: u64,
    invalid_events: u64,
}

impl TimelineCollector {
    /// Create a new collector knowing the probed functions
    pub fn new(probes: &[ResolvedProbe]) -> Self {
        Self {
            functions: probes
                .iter()
                .map(|p| (p.addr, p.symbol.clone()))
                .collect(),
            freeing: probes
                .iter()
                .filter(|p| p.tracking.is_some_and(|t| t.frees()))
                .map(|p| p.addr)
                .collect(),
            ..Default::default()
        }
    }

    /// Name of a probed function, or its address if unknown
    pub fn function_name(&self, symbol: Option<u64>) -> String {
        match symbol {
            Some(addr) => self
                .functions
                .get(&addr)
                .cloned()
                .unwrap_or_else(|| format_addr(addr)),
            None => "unknown".to_string(),
        }
    }

    /// Add an event to the collector
    pub fn add_event(&mut self, event: &TraceEvent) {
        self.total_events += 1;

        let function = self.function_name(event.symbol);
        *self.events_by_function.entry(function.clone()).or_default() += 1;

        let Some(tracking) = event.tracking else {
            self.untracked_events += 1;
            return;
        };

        let drop_reason = (tracking.drop_reason != DROP_REASON_NONE).then_some(tracking.drop_reason);
        if let Some(reason) = drop_reason {
            *self.drops_by_reason.entry(reason).or_default() += 1;
        }

        let frees = event.symbol.is_some_and(|s| self.freeing.contains(&s));

        let timeline = self.timelines.entry(tracking.id).or_default();
        timeline.last_seen = timeline.last_seen.max(event.timestamp);
        timeline.freed |= frees;
        if !timeline.skbs.contains(&tracking.skb) {
            timeline.skbs.push(tracking.skb);
        }
        timeline.entries.push(TimelineEntry {
            timestamp_ns: event.timestamp,
            function,
            skb: format_addr(tracking.skb),
            drop_reason,
        });
    }

    /// Account for an event that could not be decoded
    pub fn add_invalid(&mut self) {
        self.invalid_events += 1;
    }

    /// Generate the report
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of collection period in seconds
    /// * `kernel_counters` - Counters read from the kernel STATS map
    /// * `reaped_entries` - Stale entries removed by the reaper
    pub fn generate_report(
        &self,
        elapsed_secs: u64,
        kernel_counters: BTreeMap<String, u64>,
        reaped_entries: u64,
    ) -> TrackingReport {
        let mut ids: Vec<&SkbId> = self.timelines.keys().collect();
        ids.sort_by_key(|id| (id.timestamp, id.orig_head));

        let skbs = ids
            .into_iter()
            .map(|id| {
                let state = &self.timelines[id];
                let mut events = state.entries.clone();
                // Events from different CPUs are not ordered in the ring buffer.
                events.sort_by_key(|e| e.timestamp_ns);

                SkbTimeline {
                    orig_head: format_addr(id.orig_head),
                    created_at_ns: id.timestamp,
                    last_seen_ns: state.last_seen,
                    skb_addresses: state.skbs.iter().map(|&s| format_addr(s)).collect(),
                    freed: state.freed,
                    events,
                }
            })
            .collect();

        TrackingReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            summary: TrackingSummary {
                total_events: self.total_events,
                untracked_events: self.untracked_events,
                invalid_events: self.invalid_events,
                tracked_skbs: self.timelines.len() as u64,
                completed_skbs: self.completed_count() as u64,
                events_by_function: self.events_by_function.clone(),
                drops_by_reason: self.drops_by_reason.clone(),
                kernel_counters,
                reaped_entries,
            },
            skbs,
        }
    }

    /// Get current event count
    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    /// Get number of distinct skbs
    pub fn skb_count(&self) -> usize {
        self.timelines.len()
    }

    /// Get number of skbs whose free was seen
    pub fn completed_count(&self) -> usize {
        self.timelines.values().filter(|t| t.freed).count()
    }
}
