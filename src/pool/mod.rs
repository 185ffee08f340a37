//! Fixed arena of reusable message slots shared by the pipeline consumers.
//!
//! A slot is checked out with the set of consumers that will read it and
//! returns to the free list after each of them released it exactly once.
//! Handles carry the checkout sequence number, so a release or read through a
//! handle from an earlier checkout is detected instead of touching the new
//! payload.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::error;

use crate::extract::DecodedRecord;

/// Default number of slots.
pub const DEFAULT_SLOTS: usize = 100;

/// Identifies a pipeline consumer holding a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsumerId {
    LogSink = 0,
    WindowDispatcher = 1,
}

impl ConsumerId {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LogSink => "log_sink",
            Self::WindowDispatcher => "window_dispatcher",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    const ALL: [Self; 2] = [Self::LogSink, Self::WindowDispatcher];
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small bit set of consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConsumerSet(u8);

impl ConsumerSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn with(self, consumer: ConsumerId) -> Self {
        Self(self.0 | consumer.bit())
    }

    pub const fn contains(self, consumer: ConsumerId) -> bool {
        self.0 & consumer.bit() != 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn remove(&mut self, consumer: ConsumerId) {
        self.0 &= !consumer.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = ConsumerId> {
        ConsumerId::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Display for ConsumerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, consumer) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(consumer.as_str())?;
        }
        Ok(())
    }
}

/// Reference to a checked-out slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    sequence: u64,
}

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Pool misuse and exhaustion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted: all {capacity} slots in use")]
    Exhausted { capacity: usize },

    #[error("checkout requires at least one consumer")]
    NoConsumers,

    #[error("stale handle for slot {slot} (sequence {sequence})")]
    StaleHandle { slot: u32, sequence: u64 },

    #[error("{consumer} does not hold slot {slot} (double release or wrong consumer)")]
    NotHolder { slot: u32, consumer: ConsumerId },
}

/// A slot held past the slow-consumer threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowHold {
    pub slot: u32,
    pub sequence: u64,
    pub holders: ConsumerSet,
    pub held_for: Duration,
}

struct PoolSlot {
    payload: DecodedRecord,
    outstanding: u32,
    holders: ConsumerSet,
    sequence_id: u64,
    checked_out_at: Option<Instant>,
    slow_reported: bool,
}

/// Fixed-size arena of message slots.
pub struct MessagePool {
    slots: Vec<PoolSlot>,
    /// Stack of free slot indices; capacity is reserved up front.
    free: Vec<u32>,
    next_sequence: u64,
}

impl MessagePool {
    /// Creates a pool with `capacity` pre-allocated slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| PoolSlot {
                payload: DecodedRecord {
                    raw_text: String::with_capacity(128),
                    ..DecodedRecord::default()
                },
                outstanding: 0,
                holders: ConsumerSet::empty(),
                sequence_id: 0,
                checked_out_at: None,
                slow_reported: false,
            })
            .collect();
        // Lowest index on top so slots are handed out in order.
        let free = (0..capacity as u32).rev().collect();

        Self {
            slots,
            free,
            next_sequence: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with outstanding consumers.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Copies `record` into a free slot owned by `consumers`.
    pub fn checkout(
        &mut self,
        record: &DecodedRecord,
        consumers: ConsumerSet,
        now: Instant,
    ) -> Result<SlotHandle, PoolError> {
        if consumers.is_empty() {
            return Err(PoolError::NoConsumers);
        }

        let index = self.free.pop().ok_or(PoolError::Exhausted {
            capacity: self.slots.len(),
        })?;

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let slot = &mut self.slots[index as usize];
        slot.payload.copy_from(record);
        slot.outstanding = consumers.len() as u32;
        slot.holders = consumers;
        slot.sequence_id = sequence;
        slot.checked_out_at = Some(now);
        slot.slow_reported = false;

        Ok(SlotHandle { index, sequence })
    }

    /// Read-only view of a checked-out payload.
    pub fn payload(&self, handle: SlotHandle) -> Result<&DecodedRecord, PoolError> {
        self.live_slot(handle).map(|slot| &slot.payload)
    }

    /// Current holders of a checked-out slot.
    pub fn holders(&self, handle: SlotHandle) -> Result<ConsumerSet, PoolError> {
        self.live_slot(handle).map(|slot| slot.holders)
    }

    /// Releases `consumer`'s hold on the slot.
    ///
    /// Returns `true` when this was the last outstanding consumer and the slot
    /// went back to the free list.
    pub fn release(&mut self, handle: SlotHandle, consumer: ConsumerId) -> Result<bool, PoolError> {
        self.live_slot(handle)?;
        let slot = &mut self.slots[handle.index as usize];

        if !slot.holders.contains(consumer) {
            return Err(PoolError::NotHolder {
                slot: handle.index,
                consumer,
            });
        }

        slot.holders.remove(consumer);
        slot.outstanding -= 1;
        if slot.outstanding > 0 {
            return Ok(false);
        }

        slot.checked_out_at = None;
        self.free.push(handle.index);
        Ok(true)
    }

    /// Appends every slot held longer than `threshold` that has not been
    /// reported yet. Each checkout is reported at most once.
    pub fn collect_slow(&mut self, now: Instant, threshold: Duration, out: &mut Vec<SlowHold>) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.outstanding == 0 || slot.slow_reported {
                continue;
            }
            let Some(since) = slot.checked_out_at else {
                continue;
            };
            let held_for = now.saturating_duration_since(since);
            if held_for >= threshold {
                slot.slow_reported = true;
                out.push(SlowHold {
                    slot: index as u32,
                    sequence: slot.sequence_id,
                    holders: slot.holders,
                    held_for,
                });
            }
        }
    }

    fn live_slot(&self, handle: SlotHandle) -> Result<&PoolSlot, PoolError> {
        let stale = PoolError::StaleHandle {
            slot: handle.index,
            sequence: handle.sequence,
        };
        let slot = self.slots.get(handle.index as usize).ok_or(stale.clone())?;
        if slot.outstanding == 0 || slot.sequence_id != handle.sequence {
            return Err(stale);
        }
        Ok(slot)
    }
}

/// One consumer's claim on a checked-out slot.
///
/// Dropping the lease releases it. [`Lease::hold`] defers the release: the
/// consumer keeps the returned handle and releases it later through the
/// router.
pub struct Lease<'p> {
    pool: &'p mut MessagePool,
    handle: SlotHandle,
    consumer: ConsumerId,
    settled: bool,
}

impl<'p> Lease<'p> {
    /// Opens a lease for a consumer that currently holds `handle`.
    pub fn new(
        pool: &'p mut MessagePool,
        handle: SlotHandle,
        consumer: ConsumerId,
    ) -> Result<Self, PoolError> {
        if !pool.holders(handle)?.contains(consumer) {
            return Err(PoolError::NotHolder {
                slot: handle.index,
                consumer,
            });
        }
        Ok(Self {
            pool,
            handle,
            consumer,
            settled: false,
        })
    }

    pub fn record(&self) -> &DecodedRecord {
        &self.pool.slots[self.handle.index as usize].payload
    }

    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Releases now, surfacing misuse to the caller.
    pub fn release(mut self) -> Result<bool, PoolError> {
        self.settled = true;
        self.pool.release(self.handle, self.consumer)
    }

    /// Keeps the slot checked out past the lease; the caller owns the release.
    pub fn hold(mut self) -> SlotHandle {
        self.settled = true;
        self.handle
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.pool.release(self.handle, self.consumer) {
            error!(consumer = %self.consumer, error = %e, "lease release failed");
        }
    }
}
