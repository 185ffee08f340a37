//! Fan-out of decoded records to the pipeline consumers.
//!
//! Every record is copied into one pool slot checked out for exactly the
//! consumers that will read it, then handed to the log sink and (for window
//! commands) to the dispatcher, in that order. When the pool is exhausted the
//! record joins a backlog that is retried, oldest first, before anything newer
//! is routed.

pub mod pacing;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{PacingConfig, PoolConfig};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::extract::{DecodedRecord, RecordKind};
use crate::pool::{ConsumerId, ConsumerSet, Lease, MessagePool, PoolError, SlotHandle, SlowHold};
use crate::sink::{LogSink, WindowHost};
use crate::window::WindowCommandDispatcher;

use self::pacing::AdaptivePacer;

/// Borrowed view of the consumers a record can be routed to.
pub struct Consumers<'a> {
    pub log: &'a mut dyn LogSink,
    pub windows: &'a mut WindowCommandDispatcher,
    pub host: &'a mut dyn WindowHost,
    pub diagnostics: &'a Diagnostics,
}

/// What happened to a routed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Dispatched to every destination.
    Routed,
    /// Parked in the backlog until a slot frees up.
    Deferred,
}

/// Consumers that read records of `kind`, in dispatch order.
pub const fn destinations(kind: RecordKind) -> ConsumerSet {
    match kind {
        RecordKind::Plain | RecordKind::CogMessage => ConsumerSet::empty().with(ConsumerId::LogSink),
        RecordKind::BacktickWindow => ConsumerSet::empty()
            .with(ConsumerId::LogSink)
            .with(ConsumerId::WindowDispatcher),
    }
}

/// Ongoing pool exhaustion.
#[derive(Debug, Clone, Copy)]
struct Exhaustion {
    since: Instant,
    reported: bool,
}

pub struct MessageRouter {
    pool: MessagePool,
    pacer: AdaptivePacer,
    backlog: VecDeque<DecodedRecord>,
    exhaustion: Option<Exhaustion>,
    slow_threshold: Duration,
    exhaustion_report_after: Duration,
    slow_scratch: Vec<SlowHold>,
    routed: u64,
    /// Records dispatched since the pacer last observed a batch.
    batch_messages: u64,
    /// Most expensive dispatch in the current batch.
    batch_cost: Duration,
}

impl MessageRouter {
    pub fn new(pool: &PoolConfig, pacing: &PacingConfig) -> Self {
        let pool_slots = pool.slots.max(1);
        Self {
            pool: MessagePool::new(pool_slots),
            pacer: AdaptivePacer::new(pacing),
            backlog: VecDeque::new(),
            exhaustion: None,
            slow_threshold: pool.slow_consumer_threshold,
            exhaustion_report_after: pool.exhaustion_report_after,
            slow_scratch: Vec::with_capacity(pool_slots),
            routed: 0,
            batch_messages: 0,
            batch_cost: Duration::ZERO,
        }
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    pub fn pacer(&self) -> &AdaptivePacer {
        &self.pacer
    }

    /// Current processing interval.
    pub fn interval(&self) -> Duration {
        self.pacer.interval()
    }

    /// Records waiting for a free slot.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Records dispatched to all their destinations so far.
    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// Routes one record, after any backlog.
    pub fn route(
        &mut self,
        record: &DecodedRecord,
        consumers: &mut Consumers<'_>,
        now: Instant,
    ) -> RouteOutcome {
        self.drain_backlog(consumers, now);

        if self.backlog.is_empty() && self.dispatch(record, consumers, now) {
            return RouteOutcome::Routed;
        }

        self.backlog.push_back(record.clone());
        self.note_exhaustion(now, consumers.diagnostics);
        RouteOutcome::Deferred
    }

    /// Hands everything dispatched since the previous call to the pacer as
    /// one arrival batch. Returns the processing interval.
    pub fn end_batch(&mut self, now: Instant) -> Duration {
        let messages = std::mem::take(&mut self.batch_messages);
        let cost = std::mem::take(&mut self.batch_cost);
        self.pacer.observe(now, messages, cost)
    }

    /// Retries the backlog. Returns `true` once it is empty.
    pub fn retry_backlog(&mut self, consumers: &mut Consumers<'_>, now: Instant) -> bool {
        self.drain_backlog(consumers, now);
        self.backlog.is_empty()
    }

    /// Periodic maintenance: retries the backlog, reports sustained
    /// exhaustion and slow consumers, and returns the processing interval.
    pub fn tick(&mut self, now: Instant, consumers: &mut Consumers<'_>) -> Duration {
        self.drain_backlog(consumers, now);
        if !self.backlog.is_empty() {
            self.note_exhaustion(now, consumers.diagnostics);
        }
        self.end_batch(now);

        self.pool
            .collect_slow(now, self.slow_threshold, &mut self.slow_scratch);
        for hold in self.slow_scratch.drain(..) {
            consumers.diagnostics.emit(Diagnostic::SlowConsumer {
                slot: hold.slot,
                sequence: hold.sequence,
                holders: hold.holders,
                held_for: hold.held_for,
            });
        }

        self.pacer.tick(now)
    }

    /// Releases a slot a consumer kept past its lease.
    ///
    /// Returns `true` when the slot went back to the free list.
    pub fn release(
        &mut self,
        handle: SlotHandle,
        consumer: ConsumerId,
        diagnostics: &Diagnostics,
    ) -> bool {
        match self.pool.release(handle, consumer) {
            Ok(freed) => freed,
            Err(error) => {
                diagnostics.emit(Diagnostic::InvalidRelease { error });
                false
            }
        }
    }

    /// Drops the backlog. Returns how many records were discarded.
    pub fn discard_backlog(&mut self) -> usize {
        let discarded = self.backlog.len();
        self.backlog.clear();
        self.exhaustion = None;
        discarded
    }

    fn drain_backlog(&mut self, consumers: &mut Consumers<'_>, now: Instant) {
        while let Some(record) = self.backlog.pop_front() {
            if !self.dispatch(&record, consumers, now) {
                self.backlog.push_front(record);
                return;
            }
        }

        if let Some(episode) = self.exhaustion.take() {
            let duration = now.saturating_duration_since(episode.since);
            if episode.reported {
                info!(duration = ?duration, "message pool recovered");
            } else {
                debug!(duration = ?duration, "message pool recovered");
            }
        }
    }

    /// Checks out a slot and hands it to each destination in order.
    ///
    /// Returns `false` only when the pool is exhausted.
    fn dispatch(
        &mut self,
        record: &DecodedRecord,
        consumers: &mut Consumers<'_>,
        now: Instant,
    ) -> bool {
        let started = Instant::now();
        let targets = destinations(record.kind);

        debug_assert!(!targets.is_empty(), "{} records have no destination", record.kind);

        let handle = match self.pool.checkout(record, targets, now) {
            Ok(handle) => handle,
            Err(PoolError::Exhausted { .. }) => return false,
            Err(error) => {
                // Nothing to deliver to; the record is dropped, not deferred.
                warn!(sequence = record.sequence, kind = %record.kind, error = %error, "record not routed");
                return true;
            }
        };

        for consumer in targets.iter() {
            let lease = match Lease::new(&mut self.pool, handle, consumer) {
                Ok(lease) => lease,
                Err(error) => {
                    consumers
                        .diagnostics
                        .emit(Diagnostic::InvalidRelease { error });
                    continue;
                }
            };
            match consumer {
                ConsumerId::LogSink => consumers.log.record(lease),
                ConsumerId::WindowDispatcher => {
                    consumers
                        .windows
                        .handle(lease, consumers.host, consumers.diagnostics)
                }
            }
        }

        self.routed += 1;
        self.batch_messages += 1;
        self.batch_cost = self.batch_cost.max(started.elapsed());
        true
    }

    fn note_exhaustion(&mut self, now: Instant, diagnostics: &Diagnostics) {
        let episode = self.exhaustion.get_or_insert(Exhaustion {
            since: now,
            reported: false,
        });

        let duration = now.saturating_duration_since(episode.since);
        if !episode.reported && duration >= self.exhaustion_report_after {
            episode.reported = true;
            diagnostics.emit(Diagnostic::PoolExhausted {
                backlog: self.backlog.len(),
                duration,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::diagnostics::DiagnosticKind;
    use crate::sink::HostError;
    use crate::window::command::{Token, WindowType};

    /// Log sink that can keep its slots to simulate a slow consumer.
    #[derive(Default)]
    struct HoldingLog {
        seen: Vec<String>,
        hold: bool,
        held: Vec<SlotHandle>,
    }

    impl LogSink for HoldingLog {
        fn name(&self) -> &str {
            "holding"
        }

        fn record(&mut self, lease: Lease<'_>) {
            self.seen.push(lease.record().raw_text.clone());
            if self.hold {
                self.held.push(lease.hold());
            }
        }
    }

    #[derive(Default)]
    struct NullHost {
        created: Vec<String>,
    }

    impl WindowHost for NullHost {
        fn create(&mut self, _: WindowType, name: &str, _: &[Token<'_>]) -> Result<(), HostError> {
            self.created.push(name.to_string());
            Ok(())
        }

        fn deliver(&mut self, _: &str, _: &DecodedRecord) {}

        fn close(&mut self, _: &str) {}
    }

    struct Fixture {
        router: MessageRouter,
        log: HoldingLog,
        windows: WindowCommandDispatcher,
        host: NullHost,
        diagnostics: Diagnostics,
        seen: Arc<Mutex<Vec<DiagnosticKind>>>,
    }

    impl Fixture {
        fn new(slots: usize) -> Self {
            let pool = PoolConfig {
                slots,
                ..PoolConfig::default()
            };
            let seen = Arc::new(Mutex::new(Vec::new()));
            let mut diagnostics = Diagnostics::new();
            let sink = Arc::clone(&seen);
            diagnostics.on_diagnostic(Box::new(move |d| sink.lock().push(d.kind())));
            Self {
                router: MessageRouter::new(&pool, &PacingConfig::default()),
                log: HoldingLog::default(),
                windows: WindowCommandDispatcher::new(),
                host: NullHost::default(),
                diagnostics,
                seen,
            }
        }

        fn route(&mut self, line: &str, now: Instant) -> RouteOutcome {
            let record = DecodedRecord::new(line);
            let mut consumers = Consumers {
                log: &mut self.log,
                windows: &mut self.windows,
                host: &mut self.host,
                diagnostics: &self.diagnostics,
            };
            self.router.route(&record, &mut consumers, now)
        }

        fn tick(&mut self, now: Instant) -> Duration {
            let mut consumers = Consumers {
                log: &mut self.log,
                windows: &mut self.windows,
                host: &mut self.host,
                diagnostics: &self.diagnostics,
            };
            self.router.tick(now, &mut consumers)
        }

        fn release_held(&mut self) {
            for handle in std::mem::take(&mut self.log.held) {
                self.router
                    .release(handle, ConsumerId::LogSink, &self.diagnostics);
            }
        }
    }

    #[test]
    fn test_destinations_by_kind() {
        assert_eq!(destinations(RecordKind::Plain).len(), 1);
        assert_eq!(destinations(RecordKind::CogMessage).len(), 1);
        let window = destinations(RecordKind::BacktickWindow);
        assert!(window.contains(ConsumerId::LogSink));
        assert!(window.contains(ConsumerId::WindowDispatcher));
    }

    #[test]
    fn test_every_record_logged_and_slots_returned() {
        let mut f = Fixture::new(4);
        let now = Instant::now();
        for line in ["hello", "Cog0  INIT $0000_0000 $0000_0000 load", "`SCOPE s", "`s 1"] {
            assert_eq!(f.route(line, now), RouteOutcome::Routed);
        }
        assert_eq!(f.log.seen.len(), 4);
        assert_eq!(f.host.created, vec!["s"]);
        assert_eq!(f.router.pool().in_use(), 0);
        assert_eq!(f.router.routed(), 4);
    }

    #[test]
    fn test_exhaustion_backlogs_in_order_and_recovers() {
        let mut f = Fixture::new(2);
        f.log.hold = true;
        let now = Instant::now();

        assert_eq!(f.route("a", now), RouteOutcome::Routed);
        assert_eq!(f.route("b", now), RouteOutcome::Routed);
        assert_eq!(f.route("c", now), RouteOutcome::Deferred);
        assert_eq!(f.route("d", now), RouteOutcome::Deferred);
        assert_eq!(f.router.backlog_len(), 2);
        assert_eq!(f.router.pool().in_use(), 2);

        f.log.hold = false;
        f.release_held();
        assert_eq!(f.route("e", now), RouteOutcome::Routed);

        assert_eq!(f.log.seen, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(f.router.backlog_len(), 0);
        assert_eq!(f.router.pool().in_use(), 0);
    }

    #[test]
    fn test_sustained_exhaustion_reported_once_per_episode() {
        let mut f = Fixture::new(1);
        f.log.hold = true;
        let start = Instant::now();

        f.route("a", start);
        f.route("b", start);
        f.tick(start + Duration::from_millis(500));
        assert!(!f.seen.lock().contains(&DiagnosticKind::PoolExhausted));

        f.tick(start + Duration::from_millis(1500));
        f.tick(start + Duration::from_millis(2500));
        f.route("c", start + Duration::from_millis(2600));
        let exhausted = f
            .seen
            .lock()
            .iter()
            .filter(|k| **k == DiagnosticKind::PoolExhausted)
            .count();
        assert_eq!(exhausted, 1);

        // Recover, then a second episode reports again.
        f.log.hold = false;
        f.release_held();
        f.tick(start + Duration::from_secs(3));
        assert_eq!(f.router.backlog_len(), 0);

        f.log.hold = true;
        let later = start + Duration::from_secs(10);
        f.route("x", later);
        f.route("y", later);
        f.tick(later + Duration::from_secs(2));
        let exhausted = f
            .seen
            .lock()
            .iter()
            .filter(|k| **k == DiagnosticKind::PoolExhausted)
            .count();
        assert_eq!(exhausted, 2);
    }

    #[test]
    fn test_slow_consumer_reported_without_blocking_others() {
        let mut f = Fixture::new(4);
        f.log.hold = true;
        let start = Instant::now();
        f.route("slow", start);
        f.log.hold = false;
        f.route("fast", start);

        f.tick(start + Duration::from_millis(150));
        f.tick(start + Duration::from_millis(300));

        let slow = f
            .seen
            .lock()
            .iter()
            .filter(|k| **k == DiagnosticKind::SlowConsumer)
            .count();
        assert_eq!(slow, 1);
        assert_eq!(f.log.seen, vec!["slow", "fast"]);
        assert_eq!(f.router.pool().in_use(), 1);
    }

    #[test]
    fn test_double_release_is_a_diagnostic() {
        let mut f = Fixture::new(2);
        f.log.hold = true;
        let now = Instant::now();
        f.route("a", now);
        let handle = f.log.held[0];

        assert!(f.router.release(handle, ConsumerId::LogSink, &f.diagnostics));
        assert!(!f.router.release(handle, ConsumerId::LogSink, &f.diagnostics));
        assert_eq!(*f.seen.lock(), vec![DiagnosticKind::InvalidRelease]);
    }

    #[test]
    fn test_discard_backlog() {
        let mut f = Fixture::new(1);
        f.log.hold = true;
        let now = Instant::now();
        f.route("a", now);
        f.route("b", now);
        f.route("c", now);
        assert_eq!(f.router.discard_backlog(), 2);
        assert_eq!(f.router.backlog_len(), 0);
    }

    #[test]
    fn test_every_kind_has_a_destination() {
        for kind in RecordKind::all() {
            assert!(destinations(*kind).contains(ConsumerId::LogSink), "{kind}");
        }
    }

    #[test]
    fn test_interval_tracks_traffic() {
        let mut f = Fixture::new(8);
        let start = Instant::now();
        for i in 0..2_000u32 {
            let at = start + Duration::from_micros(100) * i;
            f.route("burst", at);
            f.router.end_batch(at);
        }
        assert!(f.router.interval() >= Duration::from_millis(19));
    }

    #[test]
    fn test_batch_counts_each_record_once() {
        let mut f = Fixture::new(8);
        let start = Instant::now();
        // Three lines per batch, one batch every 300 ms: 10 msg/s.
        for i in 0..20u32 {
            let at = start + Duration::from_millis(300) * i;
            for line in ["a", "b", "c"] {
                f.route(line, at);
            }
            f.router.end_batch(at);
        }

        let rate = f.router.pacer().sample().messages_per_second;
        assert!(rate > 5.0 && rate < 15.0, "rate {rate}");
        assert_eq!(f.router.interval(), Duration::from_millis(2));
    }
}
