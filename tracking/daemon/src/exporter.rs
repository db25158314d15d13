//! Report exporters
//!
//! Provides different exporters for the tracking report (JSON, text)

use crate::types::TrackingReport;
use anyhow::{Context, Result};
use std::{fmt::Write as _, fs::File, io::Write, path::PathBuf};

/// Trait for report exporters
pub trait ReportExporter {
    /// Export the report
    ///
    /// # Arguments
    ///
    /// * `report` - Tracking report to export
    fn export(&self, report: &TrackingReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Human readable timelines
    Text,
}

impl ExporterType {
    /// Build the exporter writing to `output_path`
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn ReportExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Text => Box::new(TextExporter::new(output_path)),
        }
    }
}

fn write_output(path: &PathBuf, content: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl ReportExporter for JsonExporter {
    fn export(&self, report: &TrackingReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_output(&self.output_path, &json)
    }
}

/// Text exporter, one block per skb
pub struct TextExporter {
    output_path: PathBuf,
}

impl TextExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Render the report as text
    fn to_text(report: &TrackingReport) -> String {
        let summary = &report.summary;
        let mut output = String::new();

        // Writing to a String cannot fail.
        let _ = writeln!(output, "skb tracking report ({})", report.timestamp);
        let _ = writeln!(output, "duration: {}s", report.duration_seconds);
        let _ = writeln!(
            output,
            "events: {} ({} untracked, {} invalid)",
            summary.total_events, summary.untracked_events, summary.invalid_events
        );
        let _ = writeln!(
            output,
            "skbs: {} ({} freed), reaped entries: {}",
            summary.tracked_skbs, summary.completed_skbs, summary.reaped_entries
        );

        if !summary.drops_by_reason.is_empty() {
            let _ = writeln!(output, "drops:");
            for (reason, count) in &summary.drops_by_reason {
                let _ = writeln!(output, "  reason {:<6} {}", reason, count);
            }
        }

        if !summary.kernel_counters.is_empty() {
            let _ = writeln!(output, "kernel counters:");
            for (name, value) in &summary.kernel_counters {
                let _ = writeln!(output, "  {:<22} {}", name, value);
            }
        }

        for skb in &report.skbs {
            let _ = writeln!(output);
            let _ = writeln!(
                output,
                "skb [{} @ {}]{}",
                skb.orig_head,
                skb.created_at_ns,
                if skb.freed { " freed" } else { "" }
            );
            for event in &skb.events {
                let offset = event.timestamp_ns.saturating_sub(skb.created_at_ns);
                let _ = write!(
                    output,
                    "  +{:>12}ns  {:<24} skb {}",
                    offset, event.function, event.skb
                );
                if let Some(reason) = event.drop_reason {
                    let _ = write!(output, " drop_reason {}", reason);
                }
                let _ = writeln!(output);
            }
        }

        output
    }
}

impl ReportExporter for TextExporter {
    fn export(&self, report: &TrackingReport) -> Result<()> {
        write_output(&self.output_path, &Self::to_text(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::BTreeMap;

    fn create_test_report() -> TrackingReport {
        TrackingReport {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            summary: TrackingSummary {
                total_events: 3,
                tracked_skbs: 1,
                completed_skbs: 1,
                drops_by_reason: BTreeMap::from([(2, 1)]),
                kernel_counters: BTreeMap::from([("tracked".to_string(), 3)]),
                ..Default::default()
            },
            skbs: vec![SkbTimeline {
                orig_head: format_addr(0xffff888011110000),
                created_at_ns: 100,
                last_seen_ns: 200,
                skb_addresses: vec![format_addr(0xffff888000001000)],
                freed: true,
                events: vec![
                    TimelineEntry {
                        timestamp_ns: 100,
                        function: "ip_rcv".to_string(),
                        skb: format_addr(0xffff888000001000),
                        drop_reason: None,
                    },
                    TimelineEntry {
                        timestamp_ns: 200,
                        function: "kfree_skb_reason".to_string(),
                        skb: format_addr(0xffff888000001000),
                        drop_reason: Some(2),
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_text_format() {
        let text = TextExporter::to_text(&create_test_report());

        assert!(text.contains("duration: 60s"));
        assert!(text.contains("skb [0xffff888011110000 @ 100] freed"));
        assert!(text.contains("+         100ns  kfree_skb_reason"));
        assert!(text.contains("drop_reason 2"));
        assert!(text.contains("tracked"));
    }

    #[test]
    fn test_json_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        JsonExporter::new(path.clone(), false)
            .export(&create_test_report())
            .unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["duration_seconds"], 60);
        assert_eq!(value["skbs"][0]["events"][1]["drop_reason"], 2);
        assert_eq!(value["summary"]["drops_by_reason"]["2"], 1);
    }

    #[test]
    fn test_exporter_type_selects_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");

        ExporterType::Text
            .exporter(path.clone())
            .export(&create_test_report())
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("skb tracking report"));
    }
}
