//! Command line and probe file configuration
//!
//! Every flag can also be set through a `KPROBE_*` environment variable.
//! A JSON probe file may describe the probe; flags given on the command
//! line take precedence over it.

use crate::{
    attach::ChannelConfig,
    delivery::DeliveryConfig,
    descriptor::{FieldSpec, ProbeDescriptor, RecordSchema},
    exporter::ExporterType,
    output::OutputFormat,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use kprobe_common::{
    OpenEvent, DEFAULT_CHANNEL_CAPACITY, DEFAULT_GRACE_PERIOD_MS, DEFAULT_POLL_TIMEOUT_MS,
    DEFAULT_PROGRAM_NAME, DEFAULT_TARGET_SYMBOL, EVENTS_MAP_NAME, TRACE_PIPE_LINE_WIDTH,
    TRACE_PIPE_PATH,
};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Where probe output is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedKind {
    /// Binary records from the probe's perf event array
    Perf,
    /// Text lines the probe prints with `bpf_trace_printk`
    TracePipe,
}

/// Attach a kprobe to a kernel function and stream its events
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Compiled BPF object containing the kprobe program
    #[clap(long, env = "KPROBE_OBJECT")]
    pub object: PathBuf,

    /// Name of the kprobe program inside the object
    #[clap(long, env = "KPROBE_PROGRAM")]
    pub program: Option<String>,

    /// Kernel function to instrument
    #[clap(short, long, env = "KPROBE_SYMBOL")]
    pub symbol: Option<String>,

    /// Record layout, e.g. "pid:u32,comm:str16"
    #[clap(long, env = "KPROBE_SCHEMA")]
    pub schema: Option<String>,

    /// JSON probe description (target_symbol, program, fields, capacity)
    #[clap(long, env = "KPROBE_PROBE_FILE")]
    pub probe_file: Option<PathBuf>,

    /// Source of probe output
    #[clap(long, value_enum, env = "KPROBE_FEED", default_value_t = FeedKind::TracePipe)]
    pub feed: FeedKind,

    /// Perf event array written by the probe (perf feed)
    #[clap(long, env = "KPROBE_MAP", default_value = EVENTS_MAP_NAME)]
    pub map: String,

    /// Kernel trace pipe (trace-pipe feed)
    #[clap(long, env = "KPROBE_TRACE_PIPE", default_value = TRACE_PIPE_PATH)]
    pub trace_pipe: PathBuf,

    /// Event channel slots (power of two)
    #[clap(long, env = "KPROBE_CAPACITY")]
    pub capacity: Option<usize>,

    /// Longest single wait for new records (milliseconds)
    #[clap(long, env = "KPROBE_POLL_TIMEOUT_MS", default_value_t = DEFAULT_POLL_TIMEOUT_MS)]
    pub poll_timeout_ms: u64,

    /// Time allowed to drain buffered records on shutdown (milliseconds)
    #[clap(long, env = "KPROBE_GRACE_MS", default_value_t = DEFAULT_GRACE_PERIOD_MS)]
    pub grace_ms: u64,

    /// Duration to trace (in seconds, 0 = until interrupted)
    #[clap(short, long, env = "KPROBE_DURATION", default_value_t = 0)]
    pub duration: u64,

    /// Event output format
    #[clap(short, long, value_enum, env = "KPROBE_FORMAT", default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Write session statistics to this file
    #[clap(long, env = "KPROBE_STATS_OUTPUT")]
    pub stats_output: Option<PathBuf>,

    /// Statistics file format
    #[clap(long, value_enum, env = "KPROBE_STATS_FORMAT", default_value_t = ExporterType::Json)]
    pub stats_format: ExporterType,

    /// Count events per value of this field (default: comm, when present)
    #[clap(long, env = "KPROBE_BREAKDOWN_FIELD")]
    pub breakdown_field: Option<String>,

    /// Progress reporting interval in seconds (0 = off)
    #[clap(long, env = "KPROBE_PROGRESS_INTERVAL", default_value_t = 10)]
    pub progress_interval: u64,

    /// Verbose logging
    #[clap(short, long, env = "KPROBE_VERBOSE")]
    pub verbose: bool,
}

/// Probe description loaded from `--probe-file`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeFile {
    pub target_symbol: Option<String>,
    pub program: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    pub capacity: Option<usize>,
}

impl ProbeFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read probe file: {:?}", path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse probe file: {:?}", path))
    }
}

/// Resolved tracer settings
#[derive(Debug)]
pub struct TracerConfig {
    pub descriptor: ProbeDescriptor,
    pub object: PathBuf,
    pub program: String,
    pub feed: FeedKind,
    pub map: String,
    pub trace_pipe: PathBuf,
    pub channel: ChannelConfig,
    pub delivery: DeliveryConfig,
    /// `None` runs until interrupted
    pub duration: Option<Duration>,
    pub format: OutputFormat,
    pub stats_output: Option<PathBuf>,
    pub stats_format: ExporterType,
    pub breakdown_field: Option<String>,
    pub progress_interval: u64,
}

impl TracerConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        let file = match &args.probe_file {
            Some(path) => ProbeFile::load(path)?,
            None => ProbeFile::default(),
        };

        let schema = match (&args.schema, file.fields.is_empty()) {
            (Some(spec), _) => RecordSchema::parse(spec)
                .with_context(|| format!("Invalid record schema: {}", spec))?,
            (None, false) => RecordSchema::new(file.fields)
                .context("Invalid record schema in probe file")?,
            (None, true) => default_schema(args.feed)?,
        };

        let symbol = args
            .symbol
            .or(file.target_symbol)
            .unwrap_or_else(|| DEFAULT_TARGET_SYMBOL.to_string());
        let descriptor = ProbeDescriptor::new(symbol, schema)?;

        let capacity = args
            .capacity
            .or(file.capacity)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        if !capacity.is_power_of_two() {
            bail!("Channel capacity must be a power of two, got {}", capacity);
        }

        let breakdown_field = match args.breakdown_field {
            Some(field) if !descriptor.schema().contains(&field) => {
                bail!("Breakdown field {} is not part of the record schema", field)
            }
            Some(field) => Some(field),
            None => descriptor
                .schema()
                .contains("comm")
                .then(|| "comm".to_string()),
        };

        Ok(Self {
            descriptor,
            object: args.object,
            program: args
                .program
                .or(file.program)
                .unwrap_or_else(|| DEFAULT_PROGRAM_NAME.to_string()),
            feed: args.feed,
            map: args.map,
            trace_pipe: args.trace_pipe,
            channel: ChannelConfig {
                capacity,
                slot_size: None,
            },
            delivery: DeliveryConfig {
                poll_timeout: Duration::from_millis(args.poll_timeout_ms.max(1)),
                grace_period: Duration::from_millis(args.grace_ms),
            },
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            format: args.format,
            stats_output: args.stats_output,
            stats_format: args.stats_format,
            breakdown_field,
            progress_interval: args.progress_interval,
        })
    }
}

/// Record layout used when none is configured
fn default_schema(feed: FeedKind) -> Result<RecordSchema> {
    let spec = match feed {
        FeedKind::Perf => OpenEvent::SCHEMA.to_string(),
        FeedKind::TracePipe => format!("msg:str{}", TRACE_PIPE_LINE_WIDTH),
    };
    Ok(RecordSchema::parse(&spec)?)
}
