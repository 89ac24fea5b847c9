//! Event feeds from the kernel into the event channel
//!
//! Perf feed: one task per CPU reading the probe's perf buffers.
//! Trace-pipe feed: a reader thread turning each `trace_pipe` line into a
//! fixed-width record.

use crate::{
    channel::{ChannelError, EventChannel},
    collector::StatsCollector,
};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use kprobe_common::MAX_CONSECUTIVE_READ_ERRORS;
use log::{debug, error, info, warn};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

/// Room for the alignment padding perf adds to every sample
const PERF_SAMPLE_SLACK: usize = 8;

/// Moves kernel output into one attachment's event channel
pub struct FeedPump {
    channel: Arc<EventChannel>,
    cancel: CancellationToken,
}

impl FeedPump {
    /// Create a new feed pump
    ///
    /// # Arguments
    ///
    /// * `channel` - Channel of the attachment being fed
    /// * `cancel` - Stops every task spawned by this pump
    pub fn new(channel: Arc<EventChannel>, cancel: CancellationToken) -> Self {
        Self { channel, cancel }
    }

    /// Spawn per-CPU perf buffer readers
    ///
    /// Samples are cut to the channel's slot size, which strips the padding
    /// perf appends. Kernel-reported losses are forwarded to the channel.
    /// After repeated read failures on a CPU the kernel link is considered
    /// gone and the channel is closed.
    pub fn spawn_perf_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<MapData>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus()?;
        info!("Spawning event readers for {} CPUs", cpus.len());

        let mut tasks = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let channel = Arc::clone(&self.channel);
            let cancel = self.cancel.clone();

            tasks.push(tokio::spawn(async move {
                let slot_size = channel.slot_size();
                // Pre-allocate buffers for reading events
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(slot_size + PERF_SAMPLE_SLACK))
                    .collect::<Vec<_>>();
                let mut failures = 0u32;

                loop {
                    let events = tokio::select! {
                        _ = cancel.cancelled() => break,
                        events = buf.read_events(&mut buffers) => events,
                    };

                    let events = match events {
                        Ok(events) => {
                            failures = 0;
                            events
                        }
                        Err(e) => {
                            failures += 1;
                            warn!("Error reading events from CPU {}: {}", cpu_id, e);
                            if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                                error!("CPU {} perf buffer unreadable, closing channel", cpu_id);
                                channel.close();
                                break;
                            }
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        debug!("CPU {} lost {} samples", cpu_id, events.lost);
                        channel.record_kernel_loss(events.lost as u64);
                    }

                    for sample in buffers.iter().take(events.read) {
                        let len = sample.len().min(slot_size);
                        if let Err(ChannelError::Closed) = channel.write(&sample[..len]) {
                            return;
                        }
                    }
                }
            }));
        }

        Ok(tasks)
    }

    /// Spawn the `trace_pipe` reader
    ///
    /// Runs on its own thread because reads block until the kernel emits a
    /// line. EOF or a read error closes the channel.
    pub fn spawn_trace_pipe_reader(&self, path: PathBuf) -> Result<thread::JoinHandle<()>> {
        let channel = Arc::clone(&self.channel);
        let cancel = self.cancel.clone();
        info!("Reading probe output from {:?}", path);

        let handle = thread::Builder::new()
            .name("trace-pipe".to_string())
            .spawn(move || {
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        error!("Failed to open {:?}: {}", path, e);
                        channel.close();
                        return;
                    }
                };

                let width = channel.slot_size();
                for line in BufReader::new(file).split(b'\n') {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match line {
                        Ok(line) => {
                            if channel.write(&fixed_width_line(&line, width)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            error!("Failed to read {:?}: {}", path, e);
                            channel.close();
                            return;
                        }
                    }
                }

                if !cancel.is_cancelled() {
                    warn!("{:?} reached end of file", path);
                    channel.close();
                }
            })?;

        Ok(handle)
    }

    /// Spawn progress reporter
    ///
    /// Periodically logs how many records were delivered and lost.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    /// * `stats` - Collector fed by the delivery loop
    pub fn spawn_progress_reporter(
        &self,
        interval_secs: u64,
        stats: Arc<Mutex<StatsCollector>>,
    ) -> JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                info!(
                    "📈 Progress: {} events delivered, {} lost, {} pending",
                    stats.event_count(),
                    stats.lost_count(),
                    channel.pending()
                );
            }
        })
    }
}

/// Store one line as a NUL-padded record of exactly `width` bytes
///
/// Lines need not be valid UTF-8; the decoder replaces invalid sequences.
pub fn fixed_width_line(line: &[u8], width: usize) -> Vec<u8> {
    let mut record = vec![0u8; width];
    let bytes = line.strip_suffix(b"\r").unwrap_or(line);
    let len = bytes.len().min(width);
    record[..len].copy_from_slice(&bytes[..len]);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fixed_width_line_pads_and_truncates() {
        assert_eq!(fixed_width_line(b"abc", 5), b"abc\0\0".to_vec());
        assert_eq!(fixed_width_line(b"abcdef", 4), b"abcd".to_vec());
        assert_eq!(fixed_width_line(b"x\r", 2), b"x\0".to_vec());
        assert_eq!(fixed_width_line(&[b'a', 0xff], 3), vec![b'a', 0xff, 0]);
    }

    #[test]
    fn test_trace_pipe_lines_reach_channel() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bash-1234 [001] d... 100.000001: bpf_trace_printk: Hello World!").unwrap();
        writeln!(file, "cat-99 [000] d... 100.000002: bpf_trace_printk: Hello World!").unwrap();
        file.flush().unwrap();

        let channel = Arc::new(EventChannel::new(8, 64).unwrap());
        let pump = FeedPump::new(Arc::clone(&channel), CancellationToken::new());
        pump.spawn_trace_pipe_reader(file.path().to_path_buf())
            .unwrap()
            .join()
            .unwrap();

        // Both lines were stored, then end of file closed the channel
        assert_eq!(channel.write_sequence(), 2);
        assert!(channel.is_closed());

        let first = channel.try_read().unwrap().unwrap();
        assert!(first.bytes.starts_with(b"bash-1234 [001]"));
        assert_eq!(first.bytes.len(), 64);
        assert!(channel.try_read().unwrap().is_some());
        assert_eq!(channel.try_read(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_missing_trace_pipe_closes_channel() {
        let channel = Arc::new(EventChannel::new(8, 64).unwrap());
        let pump = FeedPump::new(Arc::clone(&channel), CancellationToken::new());

        pump.spawn_trace_pipe_reader(PathBuf::from("/nonexistent/trace_pipe"))
            .unwrap()
            .join()
            .unwrap();

        assert!(channel.is_closed());
    }
}
