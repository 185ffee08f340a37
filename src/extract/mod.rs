//! Line extraction and classification.
//!
//! Turns buffered bytes into [`DecodedRecord`]s, one per line. CR, LF and
//! CRLF all terminate a line; the LF of a CRLF pair is swallowed even when
//! it arrives in a later chunk than its CR. Nothing is ever rejected here:
//! malformed window commands are the dispatcher's problem.

pub mod record;

pub use self::record::{DecodedRecord, RecordKind};

use crate::ingest::IngestBuffer;

/// Sentinel that introduces a window command.
pub const WINDOW_MARKER: u8 = b'`';

/// Prefix used by cog diagnostic lines (`Cog0  ...`).
const COG_PREFIX: &[u8] = b"Cog";

/// Stateful line extractor.
///
/// Holds one scratch line and one scratch record that are reused for every
/// emitted line, so steady-state extraction does not allocate.
pub struct MessageExtractor {
    line: Vec<u8>,
    record: DecodedRecord,
    /// The previous line ended with CR; a leading LF belongs to it.
    skip_lf: bool,
    next_sequence: u64,
}

impl MessageExtractor {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(256),
            record: DecodedRecord {
                raw_text: String::with_capacity(256),
                ..DecodedRecord::default()
            },
            skip_lf: false,
            next_sequence: 0,
        }
    }

    /// Sequence number the next emitted record will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Emits every complete line currently in `buf`, consuming it.
    ///
    /// Returns the number of records emitted. A trailing partial line stays
    /// in the buffer.
    pub fn drain(&mut self, buf: &mut IngestBuffer, mut emit: impl FnMut(&DecodedRecord)) -> usize {
        self.drain_while(buf, |record| {
            emit(record);
            true
        })
    }

    /// Like [`Self::drain`], but stops after the first record for which
    /// `emit` returns `false`. Lines after it stay unread in `buf`.
    pub fn drain_while(
        &mut self,
        buf: &mut IngestBuffer,
        mut emit: impl FnMut(&DecodedRecord) -> bool,
    ) -> usize {
        let mut emitted = 0;

        // An overrun may have evicted the LF we were waiting for.
        if buf.desync_pending() {
            self.skip_lf = false;
        }

        loop {
            if self.skip_lf {
                match buf.peek(0) {
                    None => break,
                    Some(b'\n') => {
                        buf.consume(1);
                        self.skip_lf = false;
                    }
                    Some(_) => self.skip_lf = false,
                }
            }

            let Some(pos) = buf.find_terminator() else {
                break;
            };
            let terminator = buf.peek(pos);

            self.line.clear();
            buf.copy_prefix_into(pos, &mut self.line);
            buf.consume(pos + 1);
            self.skip_lf = terminator == Some(b'\r');

            let corrupted = buf.take_desync();
            self.fill_record(corrupted);
            emitted += 1;
            if !emit(&self.record) {
                break;
            }
        }

        emitted
    }

    fn fill_record(&mut self, corrupted: bool) {
        let record = &mut self.record;
        record.kind = classify(&self.line);
        record.raw_text.clear();
        match std::str::from_utf8(&self.line) {
            Ok(text) => record.raw_text.push_str(text),
            Err(_) => record
                .raw_text
                .push_str(&String::from_utf8_lossy(&self.line)),
        }
        record.byte_len = self.line.len();
        record.corrupted = corrupted;
        record.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
    }
}

impl Default for MessageExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies a line (terminator already stripped) by its first
/// non-whitespace content.
pub fn classify(line: &[u8]) -> RecordKind {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let content = &line[start..];

    if content.first() == Some(&WINDOW_MARKER) {
        return RecordKind::BacktickWindow;
    }

    if is_cog_prefix(content) {
        return RecordKind::CogMessage;
    }

    RecordKind::Plain
}

/// Matches `Cog<0-7>` followed by whitespace.
fn is_cog_prefix(content: &[u8]) -> bool {
    match content.strip_prefix(COG_PREFIX) {
        Some([digit, sep, ..]) => (b'0'..=b'7').contains(digit) && sep.is_ascii_whitespace(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(chunks: &[&[u8]]) -> Vec<DecodedRecord> {
        let mut buf = IngestBuffer::new(1024);
        let mut extractor = MessageExtractor::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.append(chunk);
            buf.drain_lines_into(&mut extractor, |r| out.push(r.clone()));
        }
        out
    }

    fn texts(records: &[DecodedRecord]) -> Vec<&str> {
        records.iter().map(|r| r.raw_text.as_str()).collect()
    }

    #[test]
    fn test_classification_examples() {
        assert_eq!(
            classify(b"Cog0  INIT $0000_0000 $0000_0000 load"),
            RecordKind::CogMessage
        );
        assert_eq!(
            classify(b"`LOGIC MyLogic SAMPLES 32 'Low' 3 'Mid'"),
            RecordKind::BacktickWindow
        );
        assert_eq!(classify(b""), RecordKind::Plain);
        assert_eq!(classify(b"   `scope 1"), RecordKind::BacktickWindow);
        assert_eq!(classify(b"Cogs are great"), RecordKind::Plain);
        assert_eq!(classify(b"Cog7"), RecordKind::Plain);
        assert_eq!(classify(b"Cog9  x"), RecordKind::Plain);
        assert_eq!(classify(b"hello `world"), RecordKind::Plain);
    }

    #[test]
    fn test_all_terminators_are_stripped() {
        let records = extract_all(&[b"one\rtwo\nthree\r\nfour\n"]);
        assert_eq!(texts(&records), vec!["one", "two", "three", "four"]);
        assert!(records.iter().all(|r| !r.raw_text.contains(['\r', '\n'])));
    }

    #[test]
    fn test_crlf_split_across_chunks_is_one_terminator() {
        let records = extract_all(&[b"alpha\r", b"\nbeta\r", b"", b"\n"]);
        assert_eq!(texts(&records), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_empty_lines_are_plain_records() {
        let records = extract_all(&[b"\n\r\n\r\r"]);
        assert_eq!(records.len(), 4);
        assert!(records
            .iter()
            .all(|r| r.kind == RecordKind::Plain && r.raw_text.is_empty() && r.byte_len == 0));
    }

    #[test]
    fn test_partial_line_waits_for_terminator() {
        let mut buf = IngestBuffer::new(64);
        let mut extractor = MessageExtractor::new();
        let mut out = Vec::new();

        buf.append(b"Cog1  par");
        assert_eq!(buf.drain_lines_into(&mut extractor, |r| out.push(r.clone())), 0);
        buf.append(b"tial\n");
        assert_eq!(buf.drain_lines_into(&mut extractor, |r| out.push(r.clone())), 1);

        assert_eq!(out[0].raw_text, "Cog1  partial");
        assert_eq!(out[0].kind, RecordKind::CogMessage);
        assert_eq!(out[0].byte_len, 13);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let stream: &[u8] =
            b"Cog0  INIT $0000_0000 $0000_0000 load\r\n`SCOPE s\r\n`s 1 2 3\r\n\r\nplain\rlast\n";
        let whole = extract_all(&[stream]);

        for split in 1..stream.len() {
            let (a, b) = stream.split_at(split);
            let parts = extract_all(&[a, b]);
            assert_eq!(texts(&parts), texts(&whole), "split at {split}");
        }

        let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(texts(&extract_all(&bytewise)), texts(&whole));
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let records = extract_all(&[b"a\nb\n", b"c\n"]);
        let seqs: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_overrun_flags_next_line_only() {
        let mut buf = IngestBuffer::new(8);
        let mut extractor = MessageExtractor::new();
        let mut out = Vec::new();

        buf.append(b"abcdefgh");
        buf.append(b"ij\nok\n");
        buf.drain_lines_into(&mut extractor, |r| out.push(r.clone()));

        assert_eq!(texts(&out), vec!["ghij", "ok"]);
        assert!(out[0].corrupted);
        assert!(!out[1].corrupted);
    }

    #[test]
    fn test_drain_while_leaves_remaining_lines_buffered() {
        let mut buf = IngestBuffer::new(64);
        let mut extractor = MessageExtractor::new();
        let mut out = Vec::new();

        buf.append(b"one\r\ntwo\r\nthree\n");
        let emitted = extractor.drain_while(&mut buf, |r| {
            out.push(r.raw_text.clone());
            out.len() < 2
        });
        assert_eq!(emitted, 2);
        // The LF of the second CRLF is swallowed by the next drain.
        assert_eq!(buf.len(), "\nthree\n".len());

        extractor.drain(&mut buf, |r| out.push(r.raw_text.clone()));
        assert_eq!(out, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_invalid_utf8_is_decoded_lossily() {
        let records = extract_all(&[b"bad \xff byte\n"]);
        assert_eq!(records[0].raw_text, "bad \u{fffd} byte");
        assert_eq!(records[0].byte_len, 10);
    }
}
