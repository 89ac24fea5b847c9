//! Statistics exporters
//!
//! Provides different exporters for session statistics (JSON, Prometheus)

use crate::types::TraceStats;
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Trait for statistics exporters
pub trait StatsExporter {
    /// Export statistics
    ///
    /// # Arguments
    ///
    /// * `stats` - Aggregated statistics to export
    fn export(&self, stats: &TraceStats) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text exposition format
    #[value(alias = "prom")]
    Prometheus,
}

impl ExporterType {
    /// Build the exporter writing to `output_path`
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn StatsExporter> {
        match self {
            Self::Json => Box::new(JsonExporter::new(output_path, true)),
            Self::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        }
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(contents.as_bytes())
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

impl StatsExporter for JsonExporter {
    fn export(&self, stats: &TraceStats) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(stats)?
        } else {
            serde_json::to_string(stats)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert statistics to Prometheus format
    fn to_prometheus_format(stats: &TraceStats) -> String {
        let mut output = String::new();
        let symbol = escape_label(&stats.target_symbol);

        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            let _ = writeln!(output, "# HELP kprobe_trace_{} {}", name, help);
            let _ = writeln!(output, "# TYPE kprobe_trace_{} {}", name, kind);
            let _ = writeln!(output, "kprobe_trace_{}{{symbol=\"{}\"}} {}", name, symbol, value);
            output.push('\n');
        };

        metric("events_total", "counter", "Events delivered", stats.total_events);
        metric(
            "malformed_records_total",
            "counter",
            "Records that failed decoding",
            stats.malformed_records,
        );
        metric(
            "gaps_total",
            "counter",
            "Gap notifications delivered",
            stats.gap_notifications,
        );
        metric(
            "channel_overflow_total",
            "counter",
            "Records overwritten in the event channel",
            stats.loss.channel_overflow,
        );
        metric(
            "duration_seconds",
            "gauge",
            "Duration of the tracing session",
            stats.duration_seconds,
        );

        // Lost records by origin
        output.push_str("# HELP kprobe_trace_records_lost_total Records lost before delivery\n");
        output.push_str("# TYPE kprobe_trace_records_lost_total counter\n");
        for (origin, lost) in [
            ("channel", stats.loss.channel_lost),
            ("kernel", stats.loss.kernel_lost),
        ] {
            let _ = writeln!(
                output,
                "kprobe_trace_records_lost_total{{symbol=\"{}\",origin=\"{}\"}} {}",
                symbol, origin, lost
            );
        }
        output.push('\n');

        // Breakdown
        if let Some(field) = &stats.breakdown_field {
            let field = escape_label(field);
            output.push_str(
                "# HELP kprobe_trace_events_by_value Events per value of the breakdown field\n",
            );
            output.push_str("# TYPE kprobe_trace_events_by_value counter\n");
            for entry in &stats.breakdown {
                let _ = writeln!(
                    output,
                    "kprobe_trace_events_by_value{{symbol=\"{}\",field=\"{}\",value=\"{}\"}} {}",
                    symbol,
                    field,
                    escape_label(&entry.value),
                    entry.events
                );
            }
            output.push('\n');
        }

        output
    }
}

impl StatsExporter for PrometheusExporter {
    fn export(&self, stats: &TraceStats) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(stats))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BreakdownEntry, LossStats};

    fn create_test_stats() -> TraceStats {
        TraceStats {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            target_symbol: "do_sys_openat2".to_string(),
            total_events: 1000,
            malformed_records: 2,
            gap_notifications: 3,
            loss: LossStats {
                channel_lost: 40,
                kernel_lost: 5,
                channel_overflow: 40,
            },
            breakdown_field: Some("comm".to_string()),
            breakdown: vec![BreakdownEntry {
                value: "ba\"sh".to_string(),
                events: 900,
            }],
        }
    }

    #[test]
    fn test_prometheus_format() {
        let prometheus = PrometheusExporter::to_prometheus_format(&create_test_stats());

        assert!(prometheus.contains("kprobe_trace_events_total{symbol=\"do_sys_openat2\"} 1000"));
        assert!(prometheus.contains("kprobe_trace_duration_seconds{symbol=\"do_sys_openat2\"} 60"));
        assert!(prometheus.contains("origin=\"kernel\"} 5"));
        assert!(prometheus.contains("value=\"ba\\\"sh\"} 900"));
    }

    #[test]
    fn test_json_export_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        JsonExporter::new(path.clone(), false)
            .export(&create_test_stats())
            .unwrap();

        let parsed: TraceStats =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.total_events, 1000);
        assert_eq!(parsed.loss.kernel_lost, 5);
        assert_eq!(parsed.breakdown.len(), 1);
    }

    #[test]
    fn test_exporter_type_selects_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.prom");

        ExporterType::Prometheus
            .exporter(path.clone())
            .export(&create_test_stats())
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# HELP kprobe_trace_events_total"));
    }
}
