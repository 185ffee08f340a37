use std::sync::Arc;
use std::time::{Duration, Instant};

use p2term::config::Config;
use p2term::diagnostics::{Diagnostic, DiagnosticKind};
use p2term::extract::{DecodedRecord, RecordKind};
use p2term::pipeline::Pipeline;
use p2term::pool::{ConsumerId, Lease, SlotHandle};
use p2term::sink::{HostError, LogSink, WindowHost};
use p2term::window::command::{Token, WindowType};
use p2term::window::registry::WindowState;
use p2term::window::HostEvent;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Logged(String),
    Created(String),
    Enqueued(String, String),
    Delivered(String, String),
    Closed(String),
}

type Journal = Arc<Mutex<Vec<Seen>>>;

struct RecordingLog {
    journal: Journal,
    kinds: Vec<RecordKind>,
    corrupted: Vec<bool>,
    hold: bool,
    held: Vec<SlotHandle>,
}

impl LogSink for RecordingLog {
    fn name(&self) -> &str {
        "recording"
    }

    fn record(&mut self, lease: Lease<'_>) {
        let record = lease.record();
        self.journal.lock().push(Seen::Logged(record.raw_text.clone()));
        self.kinds.push(record.kind);
        self.corrupted.push(record.corrupted);
        if self.hold {
            self.held.push(lease.hold());
        }
    }
}

struct RecordingHost {
    journal: Journal,
}

impl WindowHost for RecordingHost {
    fn create(
        &mut self,
        _window_type: WindowType,
        name: &str,
        _params: &[Token<'_>],
    ) -> Result<(), HostError> {
        self.journal.lock().push(Seen::Created(name.to_string()));
        Ok(())
    }

    fn enqueue(&mut self, name: &str, record: &DecodedRecord) {
        self.journal
            .lock()
            .push(Seen::Enqueued(name.to_string(), record.raw_text.clone()));
    }

    fn deliver(&mut self, name: &str, record: &DecodedRecord) {
        self.journal
            .lock()
            .push(Seen::Delivered(name.to_string(), record.raw_text.clone()));
    }

    fn close(&mut self, name: &str) {
        self.journal.lock().push(Seen::Closed(name.to_string()));
    }
}

struct Harness {
    pipeline: Pipeline<RecordingLog, RecordingHost>,
    journal: Journal,
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(cfg: Config) -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let log = RecordingLog {
            journal: Arc::clone(&journal),
            kinds: Vec::new(),
            corrupted: Vec::new(),
            hold: false,
            held: Vec::new(),
        };
        let host = RecordingHost {
            journal: Arc::clone(&journal),
        };

        let mut pipeline = Pipeline::new(&cfg, log, host);
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&diagnostics);
        pipeline.on_diagnostic(Box::new(move |d| sink.lock().push(d.clone())));

        Self {
            pipeline,
            journal,
            diagnostics,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> usize {
        self.pipeline.on_bytes_received(bytes)
    }

    fn ready(&mut self, name: &str) {
        self.pipeline.on_host_event(HostEvent::Ready(name.to_string()));
    }

    fn logged(&self) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::Logged(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered_to(&self, name: &str) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::Delivered(n, text) if n == name => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn diagnostic_kinds(&self) -> Vec<DiagnosticKind> {
        self.diagnostics.lock().iter().map(Diagnostic::kind).collect()
    }
}

/// Deterministic chunk sizes in 1..=max.
fn chunk_sizes(seed: u64, max: usize) -> impl Iterator<Item = usize> {
    let mut state = seed;
    std::iter::repeat_with(move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((state >> 33) as usize % max) + 1
    })
}

#[test]
fn lines_survive_arbitrary_chunking() {
    let stream: &[u8] = b"Cog0  INIT $0000_0000 $0000_0000 load\r\n\
`LOGIC MyLogic SAMPLES 32 'Low' 3 'Mid'\r\
plain text\n\
\n\
Cog7  x\r\r\n\
`MyLogic 1 2 3\r\n";
    let expected = vec![
        "Cog0  INIT $0000_0000 $0000_0000 load",
        "`LOGIC MyLogic SAMPLES 32 'Low' 3 'Mid'",
        "plain text",
        "",
        "Cog7  x",
        "",
        "`MyLogic 1 2 3",
    ];

    for seed in 0..32u64 {
        let mut h = Harness::new();
        let mut rest = stream;
        let mut sizes = chunk_sizes(seed, 9);
        while !rest.is_empty() {
            let n = sizes.next().unwrap_or(1).min(rest.len());
            h.feed(&rest[..n]);
            rest = &rest[n..];
        }
        assert_eq!(h.logged(), expected, "seed {seed}");
    }
}

#[test]
fn records_are_classified() {
    let mut h = Harness::new();
    h.feed(b"Cog0  INIT $0000_0000 $0000_0000 load\n`LOGIC MyLogic SAMPLES 32 'Low' 3 'Mid'\n\n");

    assert_eq!(
        h.pipeline.log().kinds,
        vec![
            RecordKind::CogMessage,
            RecordKind::BacktickWindow,
            RecordKind::Plain
        ]
    );
    assert_eq!(h.logged()[2], "");
    assert!(h.journal.lock().contains(&Seen::Created("MyLogic".to_string())));
}

#[test]
fn log_sees_record_before_window() {
    let mut h = Harness::new();
    h.feed(b"`TERM t\n");
    h.ready("t");
    h.feed(b"`t 'x'\n");

    let journal = h.journal.lock().clone();
    let logged = journal
        .iter()
        .position(|s| *s == Seen::Logged("`t 'x'".to_string()))
        .expect("logged");
    let delivered = journal
        .iter()
        .position(|s| *s == Seen::Delivered("t".to_string(), "`t 'x'".to_string()))
        .expect("delivered");
    assert!(logged < delivered);
}

#[test]
fn pending_queue_keeps_order_across_ready() {
    let mut h = Harness::new();
    h.feed(b"`LOGIC MyLogic SAMPLES 32 'Low' 3 'Mid'\n`MyLogic 0\n`MyLogic 1\n`MyLogic 2\n");
    assert_eq!(
        h.pipeline.windows().state("MyLogic"),
        Some(WindowState::AwaitingReady)
    );
    assert!(h.delivered_to("MyLogic").is_empty());
    assert!(h
        .journal
        .lock()
        .contains(&Seen::Enqueued("MyLogic".to_string(), "`MyLogic 0".to_string())));

    h.ready("MyLogic");
    h.feed(b"`MyLogic 3\n");

    assert_eq!(
        h.delivered_to("MyLogic"),
        vec!["`MyLogic 0", "`MyLogic 1", "`MyLogic 2", "`MyLogic 3"]
    );
}

#[test]
fn unknown_window_type_is_one_diagnostic() {
    let mut h = Harness::new();
    h.feed(b"`FOO bar 1 2\n`SCOPE MyScope SIZE 256 128\n");

    assert_eq!(h.diagnostic_kinds(), vec![DiagnosticKind::UnknownWindow]);
    assert_eq!(
        h.pipeline.windows().state("MyScope"),
        Some(WindowState::AwaitingReady)
    );
    // The malformed command is still in the log.
    assert_eq!(h.logged()[0], "`FOO bar 1 2");
}

#[test]
fn close_lifecycle() {
    let mut h = Harness::new();
    h.feed(b"`SCOPE MyScope\n");
    h.ready("MyScope");
    h.feed(b"`MyScope 1\n`MyScope 2\n`MyScope 3\n`MyScope close\n");
    assert!(h.journal.lock().contains(&Seen::Closed("MyScope".to_string())));

    h.pipeline
        .on_host_event(HostEvent::Closed("MyScope".to_string()));
    h.feed(b"`MyScope 4\n");

    assert_eq!(
        h.delivered_to("MyScope"),
        vec!["`MyScope 1", "`MyScope 2", "`MyScope 3"]
    );
    assert_eq!(h.diagnostic_kinds(), vec![DiagnosticKind::UnknownWindow]);
    assert_eq!(h.logged().len(), 6);
}

#[test]
fn unparseable_commands_are_logged_and_reported() {
    let mut h = Harness::new();
    h.feed(b"`\n`MyTerm 'unterminated\n");

    assert_eq!(
        h.diagnostic_kinds(),
        vec![
            DiagnosticKind::UnparseableCommand,
            DiagnosticKind::UnparseableCommand
        ]
    );
    assert_eq!(h.logged(), vec!["`", "`MyTerm 'unterminated"]);
}

#[test]
fn pool_is_conserved_under_slow_log() {
    let mut cfg = Config::default();
    cfg.pool.slots = 4;
    let mut h = Harness::with_config(cfg);
    h.pipeline.log_mut().hold = true;

    let start = Instant::now();
    for i in 0..10 {
        h.pipeline
            .on_bytes_received_at(format!("line {i}\n").as_bytes(), start);
        assert!(h.pipeline.router().pool().in_use() <= 4);
    }
    // One record waits for a slot; the lines behind it stay in the ring.
    assert_eq!(h.logged().len(), 4);
    assert_eq!(h.pipeline.router().backlog_len(), 1);
    assert_eq!(h.pipeline.ingest().len(), 5 * "line N\n".len());

    // Release in batches; each tick drains as much backlog as fits.
    while !h.pipeline.log().held.is_empty() {
        let held = std::mem::take(&mut h.pipeline.log_mut().held);
        for handle in held {
            assert!(h.pipeline.release(handle, ConsumerId::LogSink));
        }
        h.pipeline.tick(start + Duration::from_millis(10));
        assert!(h.pipeline.router().pool().in_use() <= 4);
    }

    let expected: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
    assert_eq!(h.logged(), expected);
    assert_eq!(h.pipeline.router().pool().in_use(), 0);
    assert_eq!(h.pipeline.router().backlog_len(), 0);
}

#[test]
fn stuck_log_is_bounded_by_ring_capacity() {
    let mut cfg = Config::default();
    cfg.ingest.capacity = 1024;
    cfg.pool.slots = 1;
    let mut h = Harness::with_config(cfg);
    h.pipeline.log_mut().hold = true;

    let start = Instant::now();
    for i in 0..100_000 {
        h.pipeline
            .on_bytes_received_at(format!("line {i}\n").as_bytes(), start);
    }

    assert!(h.pipeline.router().backlog_len() <= 1);
    assert!(h.pipeline.ingest().len() <= 1024);
    assert!(h.pipeline.ingest().dropped_bytes() > 0);
    assert_eq!(h.logged(), vec!["line 0"]);
    assert_eq!(h.diagnostic_kinds(), vec![DiagnosticKind::BufferOverflow]);

    // Freeing the slot resumes routing; the first line out of the ring
    // carries the desync flag.
    h.pipeline.log_mut().hold = false;
    let held = std::mem::take(&mut h.pipeline.log_mut().held);
    for handle in held {
        h.pipeline.release_at(handle, ConsumerId::LogSink, start);
    }

    let corrupted = &h.pipeline.log().corrupted;
    assert_eq!(corrupted[..2], [false, false]);
    assert!(corrupted[2]);
    assert!(corrupted[3..].iter().all(|c| !c));
    assert_eq!(h.logged()[1], "line 1");
    assert_eq!(h.logged().last().map(String::as_str), Some("line 99999"));
    assert_eq!(h.pipeline.router().pool().in_use(), 0);
}

#[test]
fn window_recreated_right_after_close() {
    let mut h = Harness::new();
    h.feed(b"`SCOPE s\n");
    h.ready("s");
    h.feed(b"`s close\n`SCOPE s\n`s 1\n");

    // The host confirms the old teardown, then builds the new instance.
    h.pipeline.on_host_event(HostEvent::Closed("s".to_string()));
    assert_eq!(
        h.pipeline.windows().state("s"),
        Some(WindowState::AwaitingReady)
    );
    h.ready("s");
    h.feed(b"`s 2\n");

    assert!(h.diagnostic_kinds().is_empty());
    assert_eq!(h.delivered_to("s"), vec!["`s 1", "`s 2"]);
    let created = h
        .journal
        .lock()
        .iter()
        .filter(|s| **s == Seen::Created("s".to_string()))
        .count();
    assert_eq!(created, 2);
}

#[test]
fn slow_consumer_reported_once() {
    let mut h = Harness::new();
    h.pipeline.log_mut().hold = true;
    let start = Instant::now();
    h.pipeline.on_bytes_received_at(b"stuck\n", start);
    h.pipeline.log_mut().hold = false;
    h.pipeline.on_bytes_received_at(b"fine\n", start);

    h.pipeline.tick(start + Duration::from_millis(50));
    assert!(h.diagnostic_kinds().is_empty());
    h.pipeline.tick(start + Duration::from_millis(150));
    h.pipeline.tick(start + Duration::from_millis(400));

    assert_eq!(h.diagnostic_kinds(), vec![DiagnosticKind::SlowConsumer]);
    assert_eq!(h.logged(), vec!["stuck", "fine"]);
}

#[test]
fn overrun_flags_following_line() {
    let mut cfg = Config::default();
    cfg.ingest.capacity = 32;
    let mut h = Harness::with_config(cfg);

    let mut long = vec![b'x'; 40];
    long.push(b'\n');

    h.feed(b"short\n");
    h.feed(&long);
    h.feed(b"next\n");

    assert_eq!(h.pipeline.log().corrupted, vec![false, true, false]);
    assert_eq!(h.diagnostic_kinds(), vec![DiagnosticKind::BufferOverflow]);
    // Only the newest 31 bytes of the line fit alongside its terminator.
    assert_eq!(h.logged()[1].len(), 31);
}

#[test]
fn multi_target_command_reaches_each_window() {
    let mut h = Harness::new();
    h.feed(b"`SCOPE a\n`SCOPE b\n");
    h.ready("a");
    h.ready("b");
    h.feed(b"`a b 10 20\n");

    assert_eq!(h.delivered_to("a"), vec!["`a b 10 20"]);
    assert_eq!(h.delivered_to("b"), vec!["`a b 10 20"]);
}

#[test]
fn shutdown_discards_unready_queues() {
    let mut h = Harness::new();
    h.feed(b"`FFT f\n`f 1\n`f 2\ntrailing");
    let report = h.pipeline.shutdown(Instant::now());

    assert_eq!(report.pending_discarded, 2);
    assert_eq!(report.unterminated_bytes, "trailing".len());
}
