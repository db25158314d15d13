//! eBPF program loader
//!
//! Handles loading the eBPF program, filling its configuration maps and
//! attaching the tracking kprobe to every configured function.

use crate::{
    config::ResolvedProbe,
    types::{ProbeConfig, TrackingConfig, TrackingInfo},
};
use anyhow::{bail, Context, Result};
use aya::{
    maps::{HashMap, MapData, MapError, RingBuf},
    programs::KProbe,
    Bpf, BpfLoader,
};
use log::{info, warn};
use skbtrack_common::constants::STAT_NAMES;
use std::{collections::BTreeMap, path::PathBuf};

/// Name of the single kprobe program, attached to every function
const PROBE_PROGRAM: &str = "probe_kprobe";

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    /// * `skb_head_offset` - Offset of `head` in `struct sk_buff` for the running kernel
    pub fn load(path: Option<PathBuf>, skb_head_offset: u32) -> Result<Self> {
        info!("Loading eBPF program (skb->head at {:#x})...", skb_head_offset);

        let data = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../../target/bpfel-unknown-none/release/skbtrack"
                ))
                .to_vec()
            }
            #[cfg(not(feature = "embedded"))]
            {
                bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        let ebpf = BpfLoader::new()
            .set_global("SKB_HEAD_OFFSET", &skb_head_offset, true)
            .load(&data)
            .context("Failed to load eBPF program")?;

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Fill PROBE_CONFIG and TRACKING_CONFIG, keyed by function address
    pub fn configure_probes(&mut self, probes: &[ResolvedProbe]) -> Result<()> {
        let mut probe_config: HashMap<_, u64, ProbeConfig> = HashMap::try_from(
            self.ebpf
                .map_mut("PROBE_CONFIG")
                .context("PROBE_CONFIG map not found in eBPF object")?,
        )?;
        for probe in probes {
            probe_config
                .insert(probe.addr, probe.config, 0)
                .with_context(|| format!("Failed to configure probe {}", probe.symbol))?;
        }

        let mut tracking_config: HashMap<_, u64, TrackingConfig> = HashMap::try_from(
            self.ebpf
                .map_mut("TRACKING_CONFIG")
                .context("TRACKING_CONFIG map not found in eBPF object")?,
        )?;
        let mut special = 0;
        for probe in probes {
            if let Some(config) = probe.tracking {
                tracking_config
                    .insert(probe.addr, config, 0)
                    .with_context(|| format!("Failed to configure tracking of {}", probe.symbol))?;
                special += 1;
            }
        }

        info!(
            "Configured {} probes ({} with tracking behavior)",
            probes.len(),
            special
        );

        Ok(())
    }

    /// Attach the tracking kprobe to the resolved functions
    ///
    /// Functions that cannot be probed are skipped with a warning.
    ///
    /// # Returns
    ///
    /// Number of attached functions
    pub fn attach_kprobes(&mut self, probes: &[ResolvedProbe]) -> Result<usize> {
        info!("Attaching kprobes for skb tracking...");

        let program: &mut KProbe = self
            .ebpf
            .program_mut(PROBE_PROGRAM)
            .with_context(|| format!("{} program not found in eBPF object", PROBE_PROGRAM))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", PROBE_PROGRAM))?;
        program
            .load()
            .with_context(|| format!("Failed to load {}", PROBE_PROGRAM))?;

        let mut attached = 0;
        for probe in probes {
            match program.attach(&probe.symbol, 0) {
                Ok(_) => {
                    info!("  ✓ Attached to {}", probe.symbol);
                    attached += 1;
                }
                Err(e) => warn!("  ⚠ Failed to attach {}: {}", probe.symbol, e),
            }
        }

        if attached == 0 {
            bail!("No kprobe could be attached");
        }

        info!("{}/{} kprobes attached", attached, probes.len());

        Ok(attached)
    }

    /// Get the ring buffer carrying the events
    pub fn take_events(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .ebpf
            .take_map("EVENTS")
            .context("EVENTS map not found in eBPF object")?;

        RingBuf::try_from(map).context("Failed to create RingBuf from EVENTS map")
    }

    /// Get the tracking map, for the reaper
    pub fn take_tracking_map(&mut self) -> Result<HashMap<MapData, u64, TrackingInfo>> {
        let map = self
            .ebpf
            .take_map("TRACKING_MAP")
            .context("TRACKING_MAP map not found in eBPF object")?;

        HashMap::try_from(map).context("Failed to create HashMap from TRACKING_MAP map")
    }

    /// Read the kernel side counters
    pub fn read_stats(&self) -> Result<BTreeMap<String, u64>> {
        let stats: HashMap<_, u32, u64> = HashMap::try_from(
            self.ebpf
                .map("STATS")
                .context("STATS map not found in eBPF object")?,
        )?;

        let mut counters = BTreeMap::new();
        for (index, name) in STAT_NAMES.iter().enumerate() {
            let value = match stats.get(&(index as u32), 0) {
                Ok(value) => value,
                Err(MapError::KeyNotFound) => 0,
                Err(e) => return Err(e).with_context(|| format!("Failed to read stat {}", name)),
            };
            counters.insert(name.to_string(), value);
        }

        Ok(counters)
    }
}
