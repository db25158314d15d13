//! Event processing from the eBPF ring buffer
//!
//! Decodes raw events into their sections and feeds them to the timeline
//! collector as they arrive.

use crate::{
    collector::TimelineCollector,
    types::{SkbId, SkbTracking, TraceEvent},
};
use anyhow::{bail, Result};
use aya::maps::{MapData, RingBuf};
use bytes::Buf;
use log::{debug, info, warn};
use skbtrack_common::constants::*;
use std::{os::fd::AsRawFd, sync::Arc, time::Duration};
use tokio::{io::unix::AsyncFd, sync::Mutex, task::JoinHandle, time::interval};

/// Decode a raw event as written by the kernel program
///
/// Sections with an unknown owner are skipped. An event without a common
/// section is invalid.
pub fn parse_raw_event(data: &[u8]) -> Result<TraceEvent> {
    let mut buf = data;
    if buf.remaining() < 2 {
        bail!("Event too short: {} bytes", data.len());
    }

    let size = buf.get_u16_ne() as usize;
    if size > RAW_EVENT_DATA_SIZE || size > buf.remaining() {
        bail!("Invalid event size: {}", size);
    }
    let mut sections = &buf[..size];

    let mut timestamp = None;
    let mut symbol = None;
    let mut tracking = None;

    while sections.has_remaining() {
        if sections.remaining() < SECTION_HEADER_SIZE {
            bail!("Truncated section header");
        }
        let owner = sections.get_u8();
        let _data_type = sections.get_u8();
        let len = sections.get_u16_ne() as usize;
        if sections.remaining() < len {
            bail!("Truncated section (owner {}, {} bytes)", owner, len);
        }

        let mut payload = &sections[..len];
        sections.advance(len);

        match owner {
            SECTION_COMMON => {
                expect_len(owner, len, 8)?;
                timestamp = Some(payload.get_u64_ne());
            }
            SECTION_KERNEL => {
                expect_len(owner, len, 8)?;
                symbol = Some(payload.get_u64_ne());
            }
            SECTION_SKB_TRACKING => {
                expect_len(owner, len, 28)?;
                let orig_head = payload.get_u64_ne();
                let timestamp = payload.get_u64_ne();
                let skb = payload.get_u64_ne();
                let drop_reason = payload.get_u32_ne();
                tracking = Some(SkbTracking {
                    id: SkbId {
                        orig_head,
                        timestamp,
                    },
                    skb,
                    drop_reason,
                });
            }
            _ => debug!("Skipping section of unknown owner {}", owner),
        }
    }

    match timestamp {
        Some(timestamp) => Ok(TraceEvent {
            timestamp,
            symbol,
            tracking,
        }),
        None => bail!("Event without common section"),
    }
}

fn expect_len(owner: u8, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        bail!(
            "Section of owner {} has size {}, expected {}",
            owner,
            len,
            expected
        );
    }
    Ok(())
}

/// Pollable source of raw events
pub trait RawEventSource: AsRawFd {
    /// Hand every pending raw event to `f`
    fn drain(&mut self, f: &mut dyn FnMut(&[u8]));
}

impl RawEventSource for RingBuf<MapData> {
    fn drain(&mut self, f: &mut dyn FnMut(&[u8])) {
        while let Some(item) = self.next() {
            f(&item);
        }
    }
}

/// Event processor that reads from the ring buffer
pub struct EventProcessor {
    collector: Arc<Mutex<TimelineCollector>>,
    verbose: bool,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `collector` - Shared timeline collector
    /// * `verbose` - Log every event
    pub fn new(collector: Arc<Mutex<TimelineCollector>>, verbose: bool) -> Self {
        Self { collector, verbose }
    }

    /// Spawn the ring buffer reader
    ///
    /// The ring buffer is shared by all CPUs, a single task drains it.
    pub fn spawn_reader(&self, ring_buf: RingBuf<MapData>) -> Result<JoinHandle<()>> {
        info!("Spawning ring buffer reader");

        self.spawn_source_reader(ring_buf)
    }

    /// Spawn a reader draining `source` each time it becomes readable
    pub fn spawn_source_reader<T>(&self, source: T) -> Result<JoinHandle<()>>
    where
        T: RawEventSource + Send + 'static,
    {
        Ok(self.spawn_async_fd_reader(AsyncFd::new(source)?))
    }

    /// Spawn a reader on an already registered source
    ///
    /// The task ends when polling fails, which only happens once the
    /// runtime driving the descriptor is gone.
    pub fn spawn_async_fd_reader<T>(&self, mut async_fd: AsyncFd<T>) -> JoinHandle<()>
    where
        T: RawEventSource + Send + 'static,
    {
        let collector = Arc::clone(&self.collector);
        let verbose = self.verbose;

        tokio::spawn(async move {
            loop {
                let mut guard = match async_fd.readable_mut().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("Stopping ring buffer reader: {}", e);
                        break;
                    }
                };

                let mut collector = collector.lock().await;
                guard.get_inner_mut().drain(&mut |data| match parse_raw_event(data) {
                    Ok(event) => {
                        if verbose {
                            log_event(&collector, &event);
                        }
                        collector.add_event(&event);
                    }
                    Err(e) => {
                        debug!("Dropping invalid event: {}", e);
                        collector.add_invalid();
                    }
                });

                guard.clear_ready();
            }
        })
    }

    /// Spawn progress reporter
    ///
    /// Creates a task that periodically reports collection progress.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    pub fn spawn_progress_reporter(&self, interval_secs: u64) {
        let collector_clone = Arc::clone(&self.collector);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                ticker.tick().await;

                let collector = collector_clone.lock().await;
                info!(
                    "Progress: {} events collected, {} skbs tracked",
                    collector.event_count(),
                    collector.skb_count()
                );
            }
        });
    }
}

fn log_event(collector: &TimelineCollector, event: &TraceEvent) {
    let function = collector.function_name(event.symbol);
    match event.tracking {
        Some(t) => debug!(
            "[{}] {} skb {:#x} (head {:#x} @ {}) drop {}",
            event.timestamp, function, t.skb, t.id.orig_head, t.id.timestamp, t.drop_reason
        ),
        None => debug!("[{}] {} untracked", event.timestamp, function),
    }
}
