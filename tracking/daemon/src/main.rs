//! skbtrack - Userspace Program
//!
//! Configures and loads the eBPF skb tracking program, attaches it to the
//! selected kernel functions, rebuilds per-skb timelines from its events
//! and exports them.
//!
//! ## Usage
//!
//! ```bash
//! # Track for 30 seconds with the built-in probes, JSON report
//! sudo ./skbtrack --duration 30 --output skbs.json
//!
//! # Add probes: symbol[:skb argument position]
//! sudo ./skbtrack --probe tcp_rcv_established:1 --probe ip_finish_output2:2
//!
//! # Use a probe configuration file and a text report
//! sudo ./skbtrack --tracking-config probes.json --format text --output skbs.txt
//!
//! # Use external eBPF object file
//! sudo ./skbtrack --ebpf-object path/to/skbtrack
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use skbtrack::{
    collector::TimelineCollector,
    config::{ProbeSet, ProbeSpec, TrackingConfigFile},
    events::EventProcessor,
    exporter::ExporterType,
    kallsyms::Kallsyms,
    loader::ProbeLoader,
    reaper::Reaper,
    types::TrackingReport,
};
use skbtrack_common::constants::{DEFAULT_REAP_INTERVAL_SECS, DEFAULT_REAP_MAX_AGE_NS};
use std::{
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    signal,
    sync::Mutex,
    time::{sleep, Instant},
};

/// Kernel skb lifetime tracking using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Duration to run the probe (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// Output file for the report
    #[clap(short, long, default_value = "skbtrack-report.json")]
    output: PathBuf,

    /// Output format (json, text)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Verbose logging, prints every event
    #[clap(short, long)]
    verbose: bool,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Probe configuration file (JSON)
    #[clap(long)]
    tracking_config: Option<PathBuf>,

    /// Additional function to probe, as symbol[:skb argument position]
    #[clap(short, long)]
    probe: Vec<String>,

    /// Offset of the head field in struct sk_buff
    #[clap(long, default_value = "0xc0", value_parser = parse_offset)]
    skb_head_offset: u32,

    /// Interval between two tracking map sweeps, in seconds (0 = no sweep)
    #[clap(long, default_value_t = DEFAULT_REAP_INTERVAL_SECS)]
    reap_interval: u64,

    /// Age after which an unseen skb is untracked, in seconds
    #[clap(long, default_value_t = DEFAULT_REAP_MAX_AGE_NS / 1_000_000_000)]
    reap_max_age: u64,
}

fn parse_offset(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid offset '{}': {}", s, e))
}

fn build_probe_set(args: &Args) -> Result<ProbeSet> {
    let mut probes = ProbeSet::builtin();

    if let Some(path) = &args.tracking_config {
        info!("Loading probe configuration from: {:?}", path);
        probes.apply_file(TrackingConfigFile::load(path)?)?;
    }

    for probe in &args.probe {
        probes.upsert(ProbeSpec::parse_cli(probe)?);
    }

    probes.validate()?;

    Ok(probes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    info!("Starting skb tracking...");
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?}", args.output);
    info!("   Format: {}", args.format);

    // Parse export format
    let export_format = match args.format.to_lowercase().as_str() {
        "json" => ExporterType::Json,
        "text" | "txt" => ExporterType::Text,
        _ => bail!("Unsupported format: {}. Use json or text", args.format),
    };

    // Select and resolve the probed functions
    let probe_set = build_probe_set(&args)?;
    let kallsyms = Kallsyms::load()?;
    info!("{} kernel functions known", kallsyms.len());

    let probes = probe_set.resolve(&kallsyms);
    if probes.is_empty() {
        bail!("None of the {} configured functions exist in the running kernel", probe_set.len());
    }

    // Load eBPF program
    let mut loader = ProbeLoader::load(args.ebpf_object.clone(), args.skb_head_offset)?;
    loader.configure_probes(&probes)?;
    loader.attach_kprobes(&probes)?;

    let ring_buf = loader.take_events()?;

    info!("Tracking skbs...");

    let collector = Arc::new(Mutex::new(TimelineCollector::new(&probes)));
    let processor = EventProcessor::new(Arc::clone(&collector), args.verbose);

    let reader = processor.spawn_reader(ring_buf)?;
    processor.spawn_progress_reporter(args.progress_interval);

    let reaped = if args.reap_interval > 0 {
        let reaper = Reaper::new(
            Duration::from_secs(args.reap_interval),
            args.reap_max_age.saturating_mul(1_000_000_000),
        );
        let reaped = reaper.reaped();
        reaper.spawn(loader.take_tracking_map()?);
        Some(reaped)
    } else {
        None
    };

    // Run for specified duration or until interrupted
    let start_time = Instant::now();
    let duration = if args.duration > 0 {
        Some(Duration::from_secs(args.duration))
    } else {
        None
    };

    if let Some(d) = duration {
        tokio::select! {
            _ = sleep(d) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    let elapsed = start_time.elapsed().as_secs();
    reader.abort();

    info!("Generating tracking report...");

    let kernel_counters = loader.read_stats().context("Failed to read kernel counters")?;
    let reaped = reaped.map_or(0, |r| r.load(Ordering::Relaxed));

    let collector = collector.lock().await;
    let report = collector.generate_report(elapsed, kernel_counters, reaped);

    export_format.exporter(args.output.clone()).export(&report)?;

    info!("Report written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        skbtrack - Kernel skb Lifetime Tracking    ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(report: &TrackingReport) {
    let summary = &report.summary;

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Total events:       {}", summary.total_events);
    info!("  Untracked events:   {}", summary.untracked_events);
    info!("  Invalid events:     {}", summary.invalid_events);
    info!("  Tracked skbs:       {}", summary.tracked_skbs);
    info!("  Freed skbs:         {}", summary.completed_skbs);
    info!("  Reaped entries:     {}", summary.reaped_entries);
    info!("  Duration:           {} seconds", report.duration_seconds);
    info!("");
    info!("  Events by function:");
    for (function, count) in &summary.events_by_function {
        info!("    {:<24} {:>8}", function, count);
    }
    if !summary.drops_by_reason.is_empty() {
        info!("");
        info!("  Drops by reason:");
        for (reason, count) in &summary.drops_by_reason {
            info!("    {:<24} {:>8}", reason, count);
        }
    }
    info!("");
    info!("  Kernel counters:");
    for (name, value) in &summary.kernel_counters {
        info!("    {:<24} {:>8}", name, value);
    }
    info!("");
    info!("============================================");
}
