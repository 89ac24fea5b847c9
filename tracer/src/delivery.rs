//! Delivery loop
//!
//! Reads the attachment's event channel, decodes each record and hands the
//! result to a consumer callback in write order.
//!
//! ```text
//!  Idle ──run──▶ Running ──cancel──▶ Draining ──caught up / grace──▶ Stopped
//!                   │                                                  ▲
//!                   └────────────── channel unreadable ────────────────┘
//! ```
//!
//! Stopping always detaches the probe.

use crate::{
    attach::AttachmentHandle,
    channel::{ChannelError, EventChannel, RawRecord},
    decoder::{decode, DecodeError, DecodedEvent},
    descriptor::RecordSchema,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a [`DeliveryLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Where lost records disappeared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LossOrigin {
    /// Evicted from the event channel before they were read
    Channel,
    /// Dropped by the kernel transport before reaching the channel
    Kernel,
}

/// One item handed to the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(DecodedEvent),
    Malformed { sequence: u64, error: DecodeError },
    Gap { lost: u64, origin: LossOrigin },
}

#[derive(Error, Debug)]
pub enum FatalError {
    #[error("event channel for {symbol} became unreadable")]
    ChannelUnreadable {
        symbol: String,
        #[source]
        source: ChannelError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Longest single wait on the channel
    pub poll_timeout: Duration,
    /// Time allowed to hand out buffered records after cancellation
    pub grace_period: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(kprobe_common::DEFAULT_POLL_TIMEOUT_MS),
            grace_period: Duration::from_millis(kprobe_common::DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

/// Counters of one completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub events: u64,
    pub malformed: u64,
    pub gaps: u64,
    pub channel_lost: u64,
    pub kernel_lost: u64,
    pub overflow_count: u64,
    pub transitions: Vec<LoopState>,
}

/// Single consumer of one attachment's event channel
pub struct DeliveryLoop {
    handle: AttachmentHandle,
    channel: Arc<EventChannel>,
    schema: RecordSchema,
    config: DeliveryConfig,
    state: watch::Sender<LoopState>,
    next_sequence: u64,
    kernel_lost_seen: u64,
    report: DeliveryReport,
}

impl DeliveryLoop {
    /// Take ownership of `handle`; the loop must be the channel's only reader
    pub fn new(handle: AttachmentHandle, config: DeliveryConfig) -> Self {
        let channel = handle.channel();
        let schema = handle.descriptor().schema().clone();
        let (state, _) = watch::channel(LoopState::Idle);

        Self {
            handle,
            channel,
            schema,
            config,
            state,
            next_sequence: 0,
            kernel_lost_seen: 0,
            report: DeliveryReport {
                transitions: vec![LoopState::Idle],
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch state transitions while the loop runs
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Deliver until `cancel` fires or the channel becomes unreadable
    ///
    /// Per-record problems reach `consumer` as [`Delivery::Malformed`] and
    /// [`Delivery::Gap`]; only an unreadable channel ends the run with an
    /// error. The probe is detached before this returns.
    pub async fn run<F>(
        mut self,
        mut consumer: F,
        cancel: CancellationToken,
    ) -> Result<DeliveryReport, FatalError>
    where
        F: FnMut(Delivery),
    {
        self.transition(LoopState::Running);

        let outcome = match self.deliver(&mut consumer, &cancel).await {
            Ok(()) => {
                self.transition(LoopState::Draining);
                self.drain(&mut consumer).await;
                Ok(())
            }
            Err(err) => {
                error!("{}, stopping", err);
                Err(err)
            }
        };

        self.transition(LoopState::Stopped);
        self.report.overflow_count = self.channel.overflow_count();
        if let Err(e) = self.handle.detach() {
            warn!("{}", e);
        }

        outcome.map(|()| std::mem::take(&mut self.report))
    }

    async fn deliver<F>(
        &mut self,
        consumer: &mut F,
        cancel: &CancellationToken,
    ) -> Result<(), FatalError>
    where
        F: FnMut(Delivery),
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.channel.poll(self.config.poll_timeout, cancel).await {
                Ok(Some(record)) => self.dispatch(record, consumer),
                Ok(None) => self.report_kernel_loss(consumer),
                Err(source) => {
                    return Err(FatalError::ChannelUnreadable {
                        symbol: self.handle.descriptor().target_symbol().to_string(),
                        source,
                    })
                }
            }
        }
    }

    async fn drain<F>(&mut self, consumer: &mut F)
    where
        F: FnMut(Delivery),
    {
        let deadline = Instant::now() + self.config.grace_period;
        let target = self.channel.write_sequence();

        while self.channel.read_sequence() < target {
            if Instant::now() >= deadline {
                warn!(
                    "Grace period elapsed with {} records unread",
                    target.saturating_sub(self.channel.read_sequence())
                );
                break;
            }

            match self.channel.try_read() {
                Ok(Some(record)) => self.dispatch(record, consumer),
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped draining: {}", e);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }

        self.report_kernel_loss(consumer);
    }

    fn dispatch<F>(&mut self, record: RawRecord, consumer: &mut F)
    where
        F: FnMut(Delivery),
    {
        self.report_kernel_loss(consumer);

        // Sequence numbers are dense, so a jump is exactly the evicted records.
        if record.sequence > self.next_sequence {
            let lost = record.sequence - self.next_sequence;
            self.report.gaps += 1;
            self.report.channel_lost += lost;
            debug!("{} records overwritten before sequence {}", lost, record.sequence);
            consumer(Delivery::Gap {
                lost,
                origin: LossOrigin::Channel,
            });
        }
        self.next_sequence = record.sequence + 1;

        match decode(&record, &self.schema) {
            Ok(event) => {
                self.report.events += 1;
                consumer(Delivery::Event(event));
            }
            Err(error) => {
                self.report.malformed += 1;
                debug!("{}", error);
                consumer(Delivery::Malformed {
                    sequence: record.sequence,
                    error,
                });
            }
        }
    }

    fn report_kernel_loss<F>(&mut self, consumer: &mut F)
    where
        F: FnMut(Delivery),
    {
        let lost = self.channel.kernel_lost();
        if lost > self.kernel_lost_seen {
            let delta = lost - self.kernel_lost_seen;
            self.kernel_lost_seen = lost;
            self.report.gaps += 1;
            self.report.kernel_lost += delta;
            consumer(Delivery::Gap {
                lost: delta,
                origin: LossOrigin::Kernel,
            });
        }
    }

    fn transition(&mut self, next: LoopState) {
        let previous = self.state.send_replace(next);
        self.report.transitions.push(next);
        info!("Delivery loop {:?} -> {:?}", previous, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attach::{AttachmentManager, ChannelConfig, KernelLinker, LinkId, LinkerError},
        decoder::FieldValue,
        descriptor::ProbeDescriptor,
    };
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingLinker {
        uninstalls: AtomicU64,
    }

    impl KernelLinker for CountingLinker {
        fn install(&self, _target_symbol: &str) -> Result<LinkId, LinkerError> {
            Ok(1)
        }

        fn uninstall(&self, _link: LinkId) -> Result<(), LinkerError> {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn attach(
        linker: &Arc<CountingLinker>,
        capacity: usize,
    ) -> (AttachmentManager, AttachmentHandle) {
        let dyn_linker: Arc<dyn KernelLinker> = linker.clone();
        let manager = AttachmentManager::new(
            dyn_linker,
            ChannelConfig {
                capacity,
                slot_size: None,
            },
        );
        let schema = RecordSchema::parse("pid:u32").unwrap();
        let descriptor = ProbeDescriptor::new("do_sys_openat2", schema).unwrap();
        let handle = manager.attach(descriptor).unwrap();
        (manager, handle)
    }

    fn pid(delivery: &Delivery) -> Option<u64> {
        match delivery {
            Delivery::Event(event) => match event.get("pid") {
                Some(FieldValue::Unsigned(pid)) => Some(*pid),
                _ => None,
            },
            _ => None,
        }
    }

    fn quick() -> DeliveryConfig {
        DeliveryConfig {
            poll_timeout: Duration::from_millis(10),
            grace_period: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let linker = Arc::new(CountingLinker::default());
        let (_manager, handle) = attach(&linker, 4);

        let delivery = DeliveryLoop::new(handle, quick());
        assert_eq!(delivery.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_stop_loop() {
        let linker = Arc::new(CountingLinker::default());
        let (_manager, handle) = attach(&linker, 8);
        let channel = handle.channel();
        channel.write(&1u32.to_ne_bytes()).unwrap();
        channel.write(&[0xff, 0xff]).unwrap();
        channel.write(&3u32.to_ne_bytes()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut seen = Vec::new();
        let report = DeliveryLoop::new(handle, quick())
            .run(|d| seen.push(d), cancel)
            .await
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(pid(&seen[0]), Some(1));
        assert!(matches!(
            &seen[1],
            Delivery::Malformed {
                sequence: 1,
                error: DecodeError::Malformed {
                    expected: 4,
                    actual: 2,
                    ..
                }
            }
        ));
        assert_eq!(pid(&seen[2]), Some(3));
        assert_eq!(report.events, 2);
        assert_eq!(report.malformed, 1);
    }

    #[tokio::test]
    async fn test_kernel_loss_becomes_gap() {
        let linker = Arc::new(CountingLinker::default());
        let (_manager, handle) = attach(&linker, 8);
        let channel = handle.channel();
        channel.record_kernel_loss(5);
        channel.write(&1u32.to_ne_bytes()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut seen = Vec::new();
        let report = DeliveryLoop::new(handle, quick())
            .run(|d| seen.push(d), cancel)
            .await
            .unwrap();

        assert_eq!(
            seen[0],
            Delivery::Gap {
                lost: 5,
                origin: LossOrigin::Kernel
            }
        );
        assert!(matches!(seen[1], Delivery::Event(_)));
        assert_eq!(report.kernel_lost, 5);
        assert_eq!(report.channel_lost, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_is_fatal_and_detaches() {
        let linker = Arc::new(CountingLinker::default());
        let (manager, handle) = attach(&linker, 4);
        let channel = handle.channel();

        let delivery = DeliveryLoop::new(handle, quick());
        let states = delivery.subscribe();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            channel.close();
        });

        let result = delivery.run(|_| {}, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(FatalError::ChannelUnreadable {
                source: ChannelError::Closed,
                ..
            })
        ));
        assert_eq!(*states.borrow(), LoopState::Stopped);
        assert_eq!(linker.uninstalls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_attached("do_sys_openat2"));
    }

    #[tokio::test]
    async fn test_closed_channel_delivers_pending_records_first() {
        let linker = Arc::new(CountingLinker::default());
        let (manager, handle) = attach(&linker, 8);
        let channel = handle.channel();
        for pid in 1u32..=3 {
            channel.write(&pid.to_ne_bytes()).unwrap();
        }
        channel.close();

        let delivery = DeliveryLoop::new(handle, quick());
        let states = delivery.subscribe();
        let mut seen = Vec::new();
        let result = delivery
            .run(|d| seen.push(d), CancellationToken::new())
            .await;

        assert_eq!(seen.iter().filter_map(pid).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(seen.len(), 3);
        assert!(matches!(
            result,
            Err(FatalError::ChannelUnreadable {
                source: ChannelError::Closed,
                ..
            })
        ));
        assert_eq!(*states.borrow(), LoopState::Stopped);
        assert_eq!(linker.uninstalls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_attached("do_sys_openat2"));
    }

    #[tokio::test]
    async fn test_second_reader_is_fatal_and_detaches() {
        let linker = Arc::new(CountingLinker::default());
        let (manager, handle) = attach(&linker, 4);
        let channel = handle.channel();
        channel.write(&1u32.to_ne_bytes()).unwrap();
        let _other_reader = channel.claim_reader().unwrap();

        let delivery = DeliveryLoop::new(handle, quick());
        let states = delivery.subscribe();
        let mut seen = Vec::new();
        let result = delivery
            .run(|d| seen.push(d), CancellationToken::new())
            .await;

        assert!(seen.is_empty());
        assert!(matches!(
            result,
            Err(FatalError::ChannelUnreadable {
                source: ChannelError::ConcurrentReader,
                ..
            })
        ));
        assert_eq!(*states.borrow(), LoopState::Stopped);
        assert_eq!(linker.uninstalls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_attached("do_sys_openat2"));
        assert_eq!(channel.pending(), 1);
    }
}
