//! Kernel symbol resolution
//!
//! Probes are configured by function address (what the kprobe sees), while
//! users name functions. /proc/kallsyms maps one to the other.

use anyhow::{bail, Context, Result};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Text symbols of the running kernel
#[derive(Debug, Default)]
pub struct Kallsyms {
    by_name: HashMap<String, u64>,
}

impl Kallsyms {
    /// Load the symbols of the running kernel
    pub fn load() -> Result<Self> {
        let file = File::open(KALLSYMS_PATH)
            .with_context(|| format!("Failed to open {}", KALLSYMS_PATH))?;
        Self::parse(BufReader::new(file))
    }

    /// Parse kallsyms formatted lines: `<addr> <type> <name> [module]`
    ///
    /// Only text symbols are kept. When a name appears more than once the
    /// first address wins.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut syms = Self::default();
        let mut hidden = true;

        for line in reader.lines() {
            let line = line.context("Failed to read kallsyms")?;
            let mut fields = line.split_whitespace();

            let (Some(addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            if !matches!(kind, "t" | "T") {
                continue;
            }

            let addr = match u64::from_str_radix(addr, 16) {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            if addr != 0 {
                hidden = false;
            }

            syms.by_name.entry(name.to_string()).or_insert(addr);
        }

        if syms.by_name.is_empty() {
            bail!("No text symbol found in kallsyms");
        }
        if hidden {
            bail!("Kernel addresses are hidden (check kernel.kptr_restrict and run as root)");
        }

        Ok(syms)
    }

    /// Address of a function
    pub fn addr_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Number of known symbols
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
