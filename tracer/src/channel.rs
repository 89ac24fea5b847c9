//! Bounded event channel between the kernel feeds and the delivery loop
//!
//! A fixed ring of `capacity` slots addressed by monotonically increasing
//! sequence numbers. When the ring is full, the oldest unread record is
//! evicted to make room and counted as overflow.
//!
//! ```text
//!            read_sequence              write_sequence
//!                  |                           |
//!   ... evicted    v      unread records       v   free
//!  ┌────┬────┬────┬────┬────┬────┬────┬────┬────┬────┐
//!  │    │    │    │ r  │ r+1│ .. │ .. │ w-1│    │    │
//!  └────┴────┴────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! Producers serialise through a producer-only mutex; the single reader
//! never locks. Eviction and consumption both advance `read_sequence`
//! with a compare-and-swap, so each record is either read once or counted
//! once as overflow.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("slot size must be between 1 and {max} bytes, got {size}")]
    InvalidSlotSize { size: usize, max: usize },

    #[error("record of {len} bytes does not fit a {slot_size}-byte slot")]
    RecordTooLarge { len: usize, slot_size: usize },

    #[error("channel already has an active reader")]
    ConcurrentReader,

    #[error("channel is closed")]
    Closed,
}

/// One record as it was written into the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Position in the write order
    pub sequence: u64,
    /// Time the record entered the channel
    pub captured_at: DateTime<Utc>,
    pub bytes: Bytes,
}

struct Slot {
    len: AtomicUsize,
    captured_ns: AtomicI64,
    // Byte-wise atomics: an evicting write may race with the reader's copy,
    // which is then discarded by the failed compare-and-swap.
    bytes: Box<[AtomicU8]>,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            len: AtomicUsize::new(0),
            captured_ns: AtomicI64::new(0),
            bytes: (0..size).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

/// Bounded overwrite-oldest ring
pub struct EventChannel {
    slots: Box<[Slot]>,
    mask: u64,
    slot_size: usize,
    write_sequence: AtomicU64,
    read_sequence: AtomicU64,
    overflow: AtomicU64,
    kernel_lost: AtomicU64,
    producer: Mutex<()>,
    reading: AtomicBool,
    closed: AtomicBool,
    ready: Notify,
}

impl EventChannel {
    /// Allocate a channel of `capacity` slots, each `slot_size` bytes wide
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self, ChannelError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ChannelError::InvalidCapacity(capacity));
        }
        if slot_size == 0 || slot_size > kprobe_common::MAX_SLOT_SIZE {
            return Err(ChannelError::InvalidSlotSize {
                size: slot_size,
                max: kprobe_common::MAX_SLOT_SIZE,
            });
        }

        Ok(Self {
            slots: (0..capacity).map(|_| Slot::new(slot_size)).collect(),
            mask: capacity as u64 - 1,
            slot_size,
            write_sequence: AtomicU64::new(0),
            read_sequence: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            kernel_lost: AtomicU64::new(0),
            producer: Mutex::new(()),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn write_sequence(&self) -> u64 {
        self.write_sequence.load(Ordering::Acquire)
    }

    pub fn read_sequence(&self) -> u64 {
        self.read_sequence.load(Ordering::Acquire)
    }

    /// Number of records written but not yet read or evicted
    pub fn pending(&self) -> u64 {
        self.write_sequence().saturating_sub(self.read_sequence())
    }

    /// Records evicted because the ring was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Acquire)
    }

    /// Records the kernel transport reported as lost before they reached us
    pub fn kernel_lost(&self) -> u64 {
        self.kernel_lost.load(Ordering::Acquire)
    }

    pub fn record_kernel_loss(&self, lost: u64) {
        if lost > 0 {
            self.kernel_lost.fetch_add(lost, Ordering::AcqRel);
            self.ready.notify_one();
        }
    }

    /// Stop accepting writes and wake any waiting reader
    ///
    /// Records already written stay readable; once they are consumed every
    /// read fails with [`ChannelError::Closed`].
    pub fn close(&self) {
        // Taken so no write can complete after the flag is observed set.
        let _producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.ready.notify_waiters();
            self.ready.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append one record, evicting the oldest unread one if the ring is full
    ///
    /// Returns the sequence number assigned to the record.
    pub fn write(&self, raw: &[u8]) -> Result<u64, ChannelError> {
        if raw.len() > self.slot_size {
            return Err(ChannelError::RecordTooLarge {
                len: raw.len(),
                slot_size: self.slot_size,
            });
        }

        let sequence = {
            let _producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            let sequence = self.write_sequence.load(Ordering::Relaxed);
            self.evict_for(sequence);

            let slot = &self.slots[(sequence & self.mask) as usize];
            for (cell, byte) in slot.bytes.iter().zip(raw) {
                cell.store(*byte, Ordering::Relaxed);
            }
            slot.len.store(raw.len(), Ordering::Relaxed);
            let captured_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
            slot.captured_ns.store(captured_ns, Ordering::Relaxed);

            self.write_sequence.store(sequence + 1, Ordering::Release);
            sequence
        };

        self.ready.notify_one();
        Ok(sequence)
    }

    // Writes are serialised, so `sequence - read_sequence <= capacity` holds
    // on entry and a single eviction always frees the target slot.
    fn evict_for(&self, sequence: u64) {
        let capacity = self.capacity() as u64;
        loop {
            let read = self.read_sequence.load(Ordering::Acquire);
            if sequence < read + capacity {
                return;
            }
            if self
                .read_sequence
                .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.overflow.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }

    /// Take the next unread record without waiting
    ///
    /// A closed channel keeps handing out buffered records and reports
    /// [`ChannelError::Closed`] once it is empty.
    pub fn try_read(&self) -> Result<Option<RawRecord>, ChannelError> {
        let _reader = ReaderGuard::acquire(&self.reading)?;

        loop {
            // Loaded first: once closed, write_sequence is final.
            let closed = self.is_closed();
            let read = self.read_sequence.load(Ordering::Acquire);
            let write = self.write_sequence.load(Ordering::Acquire);
            if read >= write {
                return if closed {
                    Err(ChannelError::Closed)
                } else {
                    Ok(None)
                };
            }

            let slot = &self.slots[(read & self.mask) as usize];
            let len = slot.len.load(Ordering::Relaxed).min(self.slot_size);
            let mut bytes = BytesMut::with_capacity(len);
            for cell in &slot.bytes[..len] {
                bytes.put_u8(cell.load(Ordering::Relaxed));
            }
            let captured_ns = slot.captured_ns.load(Ordering::Relaxed);

            if self
                .read_sequence
                .compare_exchange(read, read + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(Some(RawRecord {
                    sequence: read,
                    captured_at: DateTime::from_timestamp_nanos(captured_ns),
                    bytes: bytes.freeze(),
                }));
            }
            // Evicted while copying; retry from the new read position.
        }
    }

    /// Wait up to `timeout` for the next record
    ///
    /// Returns `Ok(None)` on timeout or cancellation.
    pub async fn poll(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<RawRecord>, ChannelError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(record) = self.try_read()? {
                return Ok(Some(record));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = self.ready.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}

impl EventChannel {
    /// Hold the reader slot as another consumer would
    #[cfg(test)]
    pub(crate) fn claim_reader(&self) -> Result<impl Drop + '_, ChannelError> {
        ReaderGuard::acquire(&self.reading)
    }
}

struct ReaderGuard<'a>(&'a AtomicBool);

impl<'a> ReaderGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ChannelError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| ChannelError::ConcurrentReader)
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
