//! Kprobe Tracer - Userspace Program
//!
//! Loads a kprobe program, attaches it to a kernel function, streams its
//! events to standard output and exports session statistics.
//!
//! ## Usage
//!
//! ```bash
//! # Print every trace_pipe line of the default probe on do_sys_openat2
//! sudo ./kprobe-trace --object hello.bpf.o
//!
//! # Binary records from the perf buffer, as JSON lines, for 60 seconds
//! sudo ./kprobe-trace --object open.bpf.o --feed perf --format json --duration 60
//!
//! # Describe the probe in a file and export Prometheus statistics
//! sudo ./kprobe-trace --object probe.o --probe-file probe.json \
//!     --stats-output stats.prom --stats-format prometheus
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kprobe_tracer::{
    attach::{AttachmentManager, KernelLinker},
    collector::StatsCollector,
    config::{Args, FeedKind, TracerConfig},
    delivery::{Delivery, DeliveryLoop},
    events::FeedPump,
    loader::AyaLinker,
    output::DeliveryPrinter,
    types::TraceStats,
};
use log::{error, info, warn};
use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    signal,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

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

    let config = TracerConfig::from_args(args)?;

    info!("Starting kprobe tracer...");
    info!("   Symbol: {}", config.descriptor.target_symbol());
    info!("   Program: {}", config.program);
    info!("   Schema: {}", config.descriptor.schema());
    info!("   Feed: {:?}", config.feed);
    info!(
        "   Duration: {}",
        match config.duration {
            Some(d) => format!("{} seconds", d.as_secs()),
            None => "until interrupted".to_string(),
        }
    );

    let linker = Arc::new(AyaLinker::new(&config.object, &config.program)?);
    let kernel_linker: Arc<dyn KernelLinker> = linker.clone();
    let manager = AttachmentManager::new(kernel_linker, config.channel);

    let handle = manager
        .attach(config.descriptor.clone())
        .context("Failed to attach probe")?;

    let cancel = CancellationToken::new();
    let pump = FeedPump::new(handle.channel(), cancel.child_token());
    match config.feed {
        FeedKind::Perf => {
            let perf_array = linker.take_perf_array(&config.map)?;
            pump.spawn_perf_readers(perf_array)?;
        }
        FeedKind::TracePipe => {
            pump.spawn_trace_pipe_reader(config.trace_pipe.clone())?;
        }
    }

    let stats = Arc::new(Mutex::new(StatsCollector::new(config.breakdown_field.clone())));
    if config.progress_interval > 0 {
        pump.spawn_progress_reporter(config.progress_interval, Arc::clone(&stats));
    }

    spawn_shutdown_trigger(config.duration, cancel.clone());

    info!("Tracing {}... Ctrl-C to stop", config.descriptor.target_symbol());
    let start_time = Instant::now();

    let mut printer = DeliveryPrinter::new(io::stdout().lock(), config.format);
    let consumer = |delivery: Delivery| {
        stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(&delivery);
        if let Err(e) = printer.print(&delivery) {
            warn!("Failed to write event: {}", e);
        }
    };

    let outcome = DeliveryLoop::new(handle, config.delivery)
        .run(consumer, cancel.clone())
        .await;
    // Stops feeds and the progress reporter after a fatal stop
    cancel.cancel();
    if let Err(e) = printer.flush() {
        warn!("Failed to flush output: {}", e);
    }

    let report = outcome.context("Tracing stopped")?;

    let elapsed = start_time.elapsed().as_secs();
    let stats = stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .generate_stats(config.descriptor.target_symbol(), elapsed, report.overflow_count);

    if let Some(path) = &config.stats_output {
        config.stats_format.exporter(path.clone()).export(&stats)?;
        info!("Statistics written to {:?}", path);
    }

    print_summary(&stats);

    Ok(())
}

/// Cancel tracing on Ctrl-C or once `duration` has elapsed
fn spawn_shutdown_trigger(duration: Option<Duration>, cancel: CancellationToken) {
    tokio::spawn(async move {
        match duration {
            Some(d) => {
                tokio::select! {
                    _ = sleep(d) => {
                        info!("Duration reached, shutting down...");
                    }
                    _ = signal::ctrl_c() => {
                        info!("Interrupted, shutting down...");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            None => {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl-C: {}", e);
                        }
                        info!("Interrupted, shutting down...");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
        cancel.cancel();
    });
}

fn print_summary(stats: &TraceStats) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Symbol:             {}", stats.target_symbol);
    info!("  Duration:           {} seconds", stats.duration_seconds);
    info!("  Events:             {}", stats.total_events);
    info!("  Events/second:      {:.2}", stats.events_per_second());
    info!("  Malformed records:  {}", stats.malformed_records);
    info!("");
    info!("  Lost Records:");
    info!("    channel:          {:>8}", stats.loss.channel_lost);
    info!("    kernel:           {:>8}", stats.loss.kernel_lost);
    info!("    total:            {:>8}", stats.loss.total());
    info!("    gaps reported:    {:>8}", stats.gap_notifications);
    info!("    channel overflow: {:>8}", stats.loss.channel_overflow);

    if let Some(field) = &stats.breakdown_field {
        info!("");
        info!("  Top {} values:", field);
        for entry in stats.breakdown.iter().take(10) {
            info!("    {:<16} {:>8}", entry.value, entry.events);
        }
    }
    info!("");
    info!("============================================");
}
