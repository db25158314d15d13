//! Probe configuration
//!
//! Decides which kernel functions get probed, where their skb (and drop
//! reason) arguments are, and which of them free skbs or replace their head.
//! A built-in set covers the common rx/tx paths and the functions the
//! tracking logic relies on; a JSON file and the command line can extend or
//! replace it.
//!
//! ## File format
//!
//! ```json
//! {
//!   "replace_defaults": false,
//!   "probes": [
//!     { "symbol": "ip_output", "sk_buff": 2 },
//!     { "symbol": "kfree_skb_reason", "skb_drop_reason": 1 },
//!     { "symbol": "skb_release_data", "free": true }
//!   ]
//! }
//! ```

use crate::{kallsyms::Kallsyms, types::*};
use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use skbtrack_common::{
    constants::{ARG_UNAVAILABLE, PROBE_ARGS_MAX, PROBE_MAX},
    ProbeOffsets,
};
use std::{collections::HashSet, path::Path};

/// One probed function
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProbeSpec {
    /// Kernel function name
    pub symbol: String,
    /// Position of the `struct sk_buff *` argument
    #[serde(default)]
    pub sk_buff: i8,
    /// Position of the `enum skb_drop_reason` argument, if any
    #[serde(default)]
    pub skb_drop_reason: Option<i8>,
    /// Function frees the skb
    #[serde(default)]
    pub free: bool,
    /// Function replaces skb->head
    #[serde(default)]
    pub inv_head: bool,
}

impl ProbeSpec {
    /// A function with no special behavior
    pub fn generic(symbol: &str, sk_buff: i8) -> Self {
        Self {
            symbol: symbol.to_string(),
            sk_buff,
            skb_drop_reason: None,
            free: false,
            inv_head: false,
        }
    }

    fn freeing(mut self) -> Self {
        self.free = true;
        self
    }

    fn invalidating_head(mut self) -> Self {
        self.inv_head = true;
        self
    }

    fn with_drop_reason(mut self, index: i8) -> Self {
        self.skb_drop_reason = Some(index);
        self
    }

    /// Parse a command line probe: `symbol` or `symbol:skb_arg`
    pub fn parse_cli(s: &str) -> Result<Self> {
        let (symbol, sk_buff) = match s.split_once(':') {
            Some((symbol, index)) => (
                symbol,
                index
                    .parse::<i8>()
                    .with_context(|| format!("Invalid skb argument position in '{}'", s))?,
            ),
            None => (s, 0),
        };

        if symbol.is_empty() {
            bail!("Empty symbol in probe '{}'", s);
        }

        Ok(Self::generic(symbol, sk_buff))
    }

    /// Argument offsets as seen by the kernel program
    pub fn offsets(&self) -> ProbeOffsets {
        ProbeOffsets {
            sk_buff: self.sk_buff,
            skb_drop_reason: self.skb_drop_reason.unwrap_or(ARG_UNAVAILABLE),
        }
    }

    /// Behavior hints, only for functions needing special handling
    pub fn tracking_config(&self) -> Option<TrackingConfig> {
        (self.free || self.inv_head).then(|| TrackingConfig::new(self.free, self.inv_head))
    }

    fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            bail!("Probe with an empty symbol");
        }
        if !(0..PROBE_ARGS_MAX).contains(&self.sk_buff) {
            bail!(
                "{}: skb argument position {} out of range (0..{})",
                self.symbol,
                self.sk_buff,
                PROBE_ARGS_MAX
            );
        }
        if let Some(index) = self.skb_drop_reason {
            if !(0..PROBE_ARGS_MAX).contains(&index) || index == self.sk_buff {
                bail!(
                    "{}: invalid drop reason argument position {}",
                    self.symbol,
                    index
                );
            }
        }
        Ok(())
    }
}

/// Content of a probe configuration file
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfigFile {
    /// Start from an empty set instead of the built-in one
    #[serde(default)]
    pub replace_defaults: bool,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

impl TrackingConfigFile {
    /// Read a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tracking config: {:?}", path))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse tracking config: {:?}", path))
    }
}

/// A probe whose symbol was found in the running kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProbe {
    pub symbol: String,
    pub addr: u64,
    pub config: ProbeConfig,
    pub tracking: Option<TrackingConfig>,
}

/// Set of probes, unique by symbol
#[derive(Debug, Default, Clone)]
pub struct ProbeSet {
    probes: Vec<ProbeSpec>,
}

impl ProbeSet {
    /// Functions probed by default
    ///
    /// kfree_skbmem ends skb lifetimes; pskb_expand_head reallocates the head.
    /// skb_free_head also runs during the normal teardown, before
    /// kfree_skbmem, so it is a plain observation point. kfree_skb_reason
    /// carries the drop reason.
    pub fn builtin() -> Self {
        let probes = vec![
            ProbeSpec::generic("napi_gro_receive", 1),
            ProbeSpec::generic("netif_receive_skb", 0),
            ProbeSpec::generic("ip_rcv", 0),
            ProbeSpec::generic("tcp_v4_rcv", 0),
            ProbeSpec::generic("udp_rcv", 0),
            ProbeSpec::generic("ip_output", 2),
            ProbeSpec::generic("__dev_queue_xmit", 0),
            ProbeSpec::generic("dev_hard_start_xmit", 0),
            ProbeSpec::generic("consume_skb", 0),
            ProbeSpec::generic("kfree_skb_reason", 0).with_drop_reason(1),
            ProbeSpec::generic("pskb_expand_head", 0).invalidating_head(),
            ProbeSpec::generic("skb_free_head", 0),
            ProbeSpec::generic("kfree_skbmem", 0).freeing(),
        ];

        Self { probes }
    }

    /// Merge a configuration file; its entries override same-named ones
    pub fn apply_file(&mut self, file: TrackingConfigFile) -> Result<()> {
        if file.replace_defaults {
            self.probes.clear();
        }

        let mut seen = HashSet::new();
        for probe in file.probes {
            if !seen.insert(probe.symbol.clone()) {
                bail!("Probe '{}' configured more than once", probe.symbol);
            }
            self.upsert(probe);
        }

        Ok(())
    }

    /// Add a probe, replacing any probe on the same symbol
    pub fn upsert(&mut self, probe: ProbeSpec) {
        match self.probes.iter_mut().find(|p| p.symbol == probe.symbol) {
            Some(existing) => *existing = probe,
            None => self.probes.push(probe),
        }
    }

    /// Check the set can be loaded in the kernel maps
    pub fn validate(&self) -> Result<()> {
        if self.probes.is_empty() {
            bail!("No probe configured");
        }
        if self.probes.len() > PROBE_MAX as usize {
            bail!(
                "Too many probes: {} (max {})",
                self.probes.len(),
                PROBE_MAX
            );
        }

        for probe in &self.probes {
            probe.validate()?;
            if probe.free && probe.inv_head {
                warn!(
                    "{} both frees skbs and invalidates their head; the skb will be untracked after it",
                    probe.symbol
                );
            }
        }

        Ok(())
    }

    /// Look the symbols up, skipping those missing from the running kernel
    pub fn resolve(&self, kallsyms: &Kallsyms) -> Vec<ResolvedProbe> {
        self.probes
            .iter()
            .filter_map(|probe| match kallsyms.addr_of(&probe.symbol) {
                Some(addr) => Some(ResolvedProbe {
                    symbol: probe.symbol.clone(),
                    addr,
                    config: ProbeConfig {
                        offsets: probe.offsets(),
                    },
                    tracking: probe.tracking_config(),
                }),
                None => {
                    warn!("  ⚠ {} not found in the running kernel, skipping", probe.symbol);
                    None
                }
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeSpec> {
        self.probes.iter()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_set_is_valid() {
        let set = ProbeSet::builtin();
        assert!(set.validate().is_ok());

        let specials: Vec<_> = set
            .iter()
            .filter_map(|p| p.tracking_config().map(|c| (p.symbol.as_str(), c)))
            .collect();
        assert!(specials.contains(&("pskb_expand_head", TrackingConfig::new(false, true))));
        assert!(specials.contains(&("kfree_skbmem", TrackingConfig::new(true, false))));
        assert!(set.iter().all(|p| !(p.free && p.inv_head)));

        // Releasing the head is not the end of the skb.
        let freeing: Vec<_> = set.iter().filter(|p| p.free).map(|p| p.symbol.as_str()).collect();
        assert_eq!(freeing, ["kfree_skbmem"]);
    }

    #[test]
    fn test_file_overrides_and_extends() {
        let file: TrackingConfigFile = serde_json::from_str(
            r#"{
                "probes": [
                    { "symbol": "ip_output", "sk_buff": 1 },
                    { "symbol": "skb_release_data", "free": true }
                ]
            }"#,
        )
        .unwrap();

        let mut set = ProbeSet::builtin();
        let before = set.len();
        set.apply_file(file).unwrap();

        assert_eq!(set.len(), before + 1);
        let ip_output = set.iter().find(|p| p.symbol == "ip_output").unwrap();
        assert_eq!(ip_output.sk_buff, 1);
    }

    #[test]
    fn test_file_replaces_defaults() {
        let file: TrackingConfigFile = serde_json::from_str(
            r#"{ "replace_defaults": true, "probes": [ { "symbol": "ip_rcv" } ] }"#,
        )
        .unwrap();

        let mut set = ProbeSet::builtin();
        set.apply_file(file).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_file_duplicates_rejected() {
        let file: TrackingConfigFile = serde_json::from_str(
            r#"{ "probes": [ { "symbol": "ip_rcv" }, { "symbol": "ip_rcv", "sk_buff": 1 } ] }"#,
        )
        .unwrap();
        assert!(ProbeSet::builtin().apply_file(file).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let res: Result<TrackingConfigFile, _> =
            serde_json::from_str(r#"{ "probes": [ { "symbol": "ip_rcv", "frees": true } ] }"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_argument_positions_validated() {
        let mut set = ProbeSet::default();
        set.upsert(ProbeSpec::generic("ip_rcv", PROBE_ARGS_MAX));
        assert!(set.validate().is_err());

        let mut set = ProbeSet::default();
        set.upsert(ProbeSpec::generic("kfree_skb_reason", 0).with_drop_reason(0));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_free_and_inv_head_accepted() {
        let mut set = ProbeSet::default();
        set.upsert(ProbeSpec::generic("odd_function", 0).freeing().invalidating_head());
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_parse_cli() {
        assert_eq!(
            ProbeSpec::parse_cli("ip_rcv").unwrap(),
            ProbeSpec::generic("ip_rcv", 0)
        );
        assert_eq!(
            ProbeSpec::parse_cli("ip_output:2").unwrap(),
            ProbeSpec::generic("ip_output", 2)
        );
        assert!(ProbeSpec::parse_cli("ip_output:x").is_err());
        assert!(ProbeSpec::parse_cli(":1").is_err());
    }

    #[test]
    fn test_resolve_skips_missing_symbols() {
        let kallsyms = Kallsyms::parse(
            "ffffffff81a01230 T kfree_skbmem\nffffffff81a04560 t ip_rcv\n".as_bytes(),
        )
        .unwrap();

        let resolved = ProbeSet::builtin().resolve(&kallsyms);

        assert_eq!(resolved.len(), 2);
        let free = resolved.iter().find(|p| p.symbol == "kfree_skbmem").unwrap();
        assert_eq!(free.addr, 0xffffffff81a01230);
        assert_eq!(free.tracking, Some(TrackingConfig::new(true, false)));
        let rcv = resolved.iter().find(|p| p.symbol == "ip_rcv").unwrap();
        assert_eq!(rcv.tracking, None);
        assert_eq!(rcv.config.offsets.skb_drop_reason, ARG_UNAVAILABLE);
    }
}
