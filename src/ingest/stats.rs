use std::sync::atomic::{AtomicU64, Ordering};

use crate::extract::record::{RecordKind, MAX_RECORD_KIND};

/// Lock-free per-RecordKind counters.
///
/// `snapshot()` atomically reads and resets all counters, so the terminal
/// can log a periodic throughput summary without contention.
pub struct RecordStats {
    counts: [AtomicU64; MAX_RECORD_KIND + 1],
    bytes: AtomicU64,
}

impl RecordStats {
    /// Create a new zeroed RecordStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes: AtomicU64::new(0),
        }
    }

    /// Count one record of the given kind and its byte length.
    pub fn record(&self, kind: RecordKind, byte_len: usize) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes.fetch_add(byte_len as u64, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero kinds
    /// plus the total line bytes seen.
    pub fn snapshot(&self) -> (Vec<(RecordKind, u64)>, u64) {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = RecordKind::from_u8(i as u8) {
                    result.push((kind, v));
                }
            }
        }

        (result, self.bytes.swap(0, Ordering::Relaxed))
    }
}

impl Default for RecordStats {
    fn default() -> Self {
        Self::new()
    }
}
