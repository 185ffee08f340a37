use std::fmt;

/// RecordKind classifies a decoded line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Anything that is neither a COG message nor a window command.
    #[default]
    Plain = 0,
    /// Diagnostic line emitted by one of the target's cogs (`Cog<N> ...`).
    CogMessage = 1,
    /// Window-directed command, prefixed by the backtick marker.
    BacktickWindow = 2,
}

/// Maximum RecordKind value, used for array sizing.
pub const MAX_RECORD_KIND: usize = 2;

impl RecordKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::CogMessage => "cog",
            Self::BacktickWindow => "backtick",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Plain),
            1 => Some(Self::CogMessage),
            2 => Some(Self::BacktickWindow),
            _ => None,
        }
    }

    /// Returns all record kinds.
    pub const fn all() -> &'static [Self] {
        &[Self::Plain, Self::CogMessage, Self::BacktickWindow]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded line of target output.
///
/// Records are logically immutable once extracted. The extractor and the
/// message pool reuse the `raw_text` allocation across records, so copy with
/// [`DecodedRecord::copy_from`] rather than `clone` on hot paths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedRecord {
    pub kind: RecordKind,
    /// Line content without its terminator.
    pub raw_text: String,
    /// Number of source bytes in the line, terminator excluded.
    pub byte_len: usize,
    /// Set when bytes preceding this line were evicted from the ingest buffer.
    pub corrupted: bool,
    /// Monotonic extraction sequence number.
    pub sequence: u64,
}

impl DecodedRecord {
    /// Builds a standalone record, classifying `text`.
    pub fn new(text: &str) -> Self {
        Self {
            kind: super::classify(text.as_bytes()),
            raw_text: text.to_string(),
            byte_len: text.len(),
            corrupted: false,
            sequence: 0,
        }
    }

    /// Overwrites `self` with `other`, keeping the existing text allocation.
    pub fn copy_from(&mut self, other: &DecodedRecord) {
        self.kind = other.kind;
        self.raw_text.clear();
        self.raw_text.push_str(&other.raw_text);
        self.byte_len = other.byte_len;
        self.corrupted = other.corrupted;
        self.sequence = other.sequence;
    }
}
