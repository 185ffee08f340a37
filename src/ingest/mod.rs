//! Fixed-capacity byte ring that accumulates transport output until complete
//! lines can be extracted.
//!
//! The ring never blocks the writer. When unread bytes would exceed the
//! capacity, the oldest unread bytes are evicted and a desync flag is raised;
//! the extractor attaches it to the next line it emits.

pub mod stats;

use crate::extract::{DecodedRecord, MessageExtractor};

/// Default ingest capacity: 1 MiB.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Result of a single [`IngestBuffer::append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bytes written into the ring.
    pub written: usize,
    /// Unread bytes evicted to make room (including any that never fit).
    pub evicted: usize,
}

/// Circular byte accumulator owned by the extraction context.
pub struct IngestBuffer {
    buf: Box<[u8]>,
    /// Index of the oldest unread byte.
    head: usize,
    /// Number of unread bytes.
    len: usize,
    /// Leading unread bytes already known to contain no line terminator.
    scanned: usize,
    desync: bool,
    dropped_bytes: u64,
}

impl IngestBuffer {
    /// Creates a ring with the given capacity in bytes.
    ///
    /// A zero capacity is bumped to one byte so the ring stays usable.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            head: 0,
            len: 0,
            scanned: 0,
            desync: false,
            dropped_bytes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes evicted by overruns since creation.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Whether an overrun happened since the last emitted line.
    pub fn desync_pending(&self) -> bool {
        self.desync
    }

    /// Writes `bytes` at the tail, evicting the oldest unread bytes if needed.
    pub fn append(&mut self, bytes: &[u8]) -> AppendOutcome {
        let cap = self.capacity();
        let mut outcome = AppendOutcome::default();

        // Only the newest `cap` bytes of an oversized chunk can survive.
        let bytes = if bytes.len() > cap {
            let skip = bytes.len() - cap;
            outcome.evicted += skip;
            &bytes[skip..]
        } else {
            bytes
        };

        let overflow = (self.len + bytes.len()).saturating_sub(cap);
        if overflow > 0 {
            self.evict(overflow);
            outcome.evicted += overflow;
        }

        if outcome.evicted > 0 {
            self.desync = true;
            self.dropped_bytes = self.dropped_bytes.saturating_add(outcome.evicted as u64);
        }

        let tail = (self.head + self.len) % cap;
        let first = bytes.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&bytes[first..]);
        }
        self.len += bytes.len();
        outcome.written = bytes.len();

        outcome
    }

    /// Hands every complete line to `extractor`, which emits records to `emit`.
    ///
    /// Returns the number of records emitted.
    pub fn drain_lines_into(
        &mut self,
        extractor: &mut MessageExtractor,
        emit: impl FnMut(&DecodedRecord),
    ) -> usize {
        extractor.drain(self, emit)
    }

    /// Hands complete lines to `extractor` until `emit` returns `false`.
    pub fn drain_lines_while(
        &mut self,
        extractor: &mut MessageExtractor,
        emit: impl FnMut(&DecodedRecord) -> bool,
    ) -> usize {
        extractor.drain_while(self, emit)
    }

    /// Unread bytes as at most two contiguous slices, oldest first.
    pub fn unread_slices(&self) -> (&[u8], &[u8]) {
        let cap = self.capacity();
        if self.head + self.len <= cap {
            (&self.buf[self.head..self.head + self.len], &[])
        } else {
            let first = cap - self.head;
            (&self.buf[self.head..], &self.buf[..self.len - first])
        }
    }

    /// Returns the unread byte at `offset`, if present.
    pub fn peek(&self, offset: usize) -> Option<u8> {
        if offset >= self.len {
            return None;
        }
        Some(self.buf[(self.head + offset) % self.capacity()])
    }

    /// Finds the offset of the first CR or LF among the unread bytes.
    ///
    /// Bytes scanned without success are remembered so repeated calls on a
    /// growing partial line only look at new data.
    pub fn find_terminator(&mut self) -> Option<usize> {
        let start = self.scanned;
        let (a, b) = self.unread_slices();
        let found = if start < a.len() {
            position_of_eol(&a[start..])
                .map(|i| start + i)
                .or_else(|| position_of_eol(b).map(|i| a.len() + i))
        } else {
            let off = start - a.len();
            position_of_eol(&b[off..]).map(|i| start + i)
        };

        if found.is_none() {
            self.scanned = self.len;
        }
        found
    }

    /// Appends the first `n` unread bytes to `out`.
    pub fn copy_prefix_into(&self, n: usize, out: &mut Vec<u8>) {
        let n = n.min(self.len);
        let (a, b) = self.unread_slices();
        if n <= a.len() {
            out.extend_from_slice(&a[..n]);
        } else {
            out.extend_from_slice(a);
            out.extend_from_slice(&b[..n - a.len()]);
        }
    }

    /// Marks the first `n` unread bytes as read.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        self.scanned = self.scanned.saturating_sub(n);
        if self.len == 0 {
            self.head = 0;
        }
    }

    /// Clears and returns the desync flag.
    pub fn take_desync(&mut self) -> bool {
        std::mem::take(&mut self.desync)
    }

    fn evict(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head = (self.head + n) % self.capacity();
        self.len -= n;
        self.scanned = self.scanned.saturating_sub(n);
    }
}

fn position_of_eol(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == b'\n' || b == b'\r')
}
