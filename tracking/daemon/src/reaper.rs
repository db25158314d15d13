//! Tracking map reaper
//!
//! The kernel side never removes entries of skbs whose free it did not see
//! (freeing function not probed, lost event, full map at the wrong time).
//! The reaper periodically removes entries not seen for a while, using the
//! `last_seen` timestamp kept up to date by every probe.

use crate::types::TrackingInfo;
use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::interval};

/// A tracking store that can be walked and pruned from userspace
pub trait AgedStore {
    /// Snapshot of the entries
    fn entries(&self) -> Result<Vec<(u64, TrackingInfo)>>;
    /// Remove an entry; removing a missing entry is not an error
    fn remove(&mut self, key: u64) -> Result<()>;
}

impl AgedStore for HashMap<MapData, u64, TrackingInfo> {
    fn entries(&self) -> Result<Vec<(u64, TrackingInfo)>> {
        // Entries can vanish while iterating; skip those errors.
        Ok(self.iter().filter_map(|entry| entry.ok()).collect())
    }

    fn remove(&mut self, key: u64) -> Result<()> {
        match HashMap::remove(self, &key) {
            Ok(()) | Err(aya::maps::MapError::KeyNotFound) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove tracking entry {:#x}", key)),
        }
    }
}

/// Remove entries older than `max_age` nanoseconds, returns how many
///
/// An entry refreshed by a probe between the snapshot and its removal is
/// lost; this only costs the continuity of that skb timeline.
pub fn sweep<S: AgedStore>(store: &mut S, now: u64, max_age: u64) -> Result<usize> {
    let stale: Vec<u64> = store
        .entries()?
        .into_iter()
        .filter(|(_, info)| now.saturating_sub(info.last_seen) > max_age)
        .map(|(key, _)| key)
        .collect();

    for key in &stale {
        store.remove(*key)?;
    }

    Ok(stale.len())
}

/// Current CLOCK_MONOTONIC time in nanoseconds, the clock of bpf_ktime_get_ns
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on Linux.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Periodic sweeper of the kernel tracking map
pub struct Reaper {
    interval: Duration,
    max_age_ns: u64,
    reaped: Arc<AtomicU64>,
}

impl Reaper {
    /// Create a new reaper
    ///
    /// # Arguments
    ///
    /// * `interval` - Time between two sweeps
    /// * `max_age_ns` - Entries not seen for longer are removed
    pub fn new(interval: Duration, max_age_ns: u64) -> Self {
        Self {
            interval,
            max_age_ns,
            reaped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared count of removed entries
    pub fn reaped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reaped)
    }

    /// Spawn the sweeping task, taking ownership of the map
    pub fn spawn<S>(self, mut store: S) -> JoinHandle<()>
    where
        S: AgedStore + Send + 'static,
    {
        info!(
            "Reaping tracking entries older than {}s every {}s",
            self.max_age_ns / 1_000_000_000,
            self.interval.as_secs()
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            // The first tick completes immediately, nothing to reap yet.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match sweep(&mut store, monotonic_ns(), self.max_age_ns) {
                    Ok(0) => {}
                    Ok(n) => {
                        debug!("Reaped {} stale tracking entries", n);
                        self.reaped.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => warn!("Tracking map sweep failed: {:#}", e),
                }
            }
        })
    }
}
