//! The single-context message pipeline.
//!
//! [`Pipeline`] owns the ingest buffer, extractor, router and window
//! dispatcher together with the log sink and window host they feed. All
//! mutation happens through `&mut self`, so the core needs no locks; the
//! async terminal loop is the only caller in production.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::diagnostics::{Diagnostic, DiagnosticHandler, Diagnostics};
use crate::export::health::HealthMetrics;
use crate::extract::MessageExtractor;
use crate::ingest::stats::RecordStats;
use crate::ingest::IngestBuffer;
use crate::pool::{ConsumerId, SlotHandle};
use crate::router::{Consumers, MessageRouter, RouteOutcome};
use crate::sink::{LogSink, WindowHost};
use crate::window::registry::WindowState;
use crate::window::{HostEvent, WindowCommandDispatcher};

/// What was lost when the pipeline stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records still waiting for a pool slot.
    pub backlog_discarded: usize,
    /// Records queued for windows that never became ready.
    pub pending_discarded: usize,
    /// Bytes of a trailing line that never got its terminator.
    pub unterminated_bytes: usize,
}

pub struct Pipeline<L, H> {
    ingest: IngestBuffer,
    extractor: MessageExtractor,
    router: MessageRouter,
    windows: WindowCommandDispatcher,
    log: L,
    host: H,
    diagnostics: Diagnostics,
    stats: Arc<RecordStats>,
    metrics: Option<Arc<HealthMetrics>>,
    /// Bytes evicted in the current overrun episode. The episode ends with
    /// the first clean line extracted after it.
    overrun: Option<usize>,
}

impl<L: LogSink, H: WindowHost> Pipeline<L, H> {
    pub fn new(cfg: &Config, log: L, host: H) -> Self {
        Self {
            ingest: IngestBuffer::new(cfg.ingest.capacity),
            extractor: MessageExtractor::new(),
            router: MessageRouter::new(&cfg.pool, &cfg.pacing),
            windows: WindowCommandDispatcher::new(),
            log,
            host,
            diagnostics: Diagnostics::new(),
            stats: Arc::new(RecordStats::new()),
            metrics: None,
            overrun: None,
        }
    }

    /// Exports pipeline state through `metrics` and counts diagnostics there.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        metrics
            .ingest_capacity_bytes
            .set(self.ingest.capacity() as f64);
        metrics
            .pool_slots_capacity
            .set(self.router.pool().capacity() as f64);

        let counted = Arc::clone(&metrics);
        self.diagnostics.on_diagnostic(Box::new(move |d| {
            counted
                .diagnostics
                .with_label_values(&[d.kind().as_str()])
                .inc();
        }));

        self.metrics = Some(metrics);
        self
    }

    /// Registers an additional diagnostic handler.
    pub fn on_diagnostic(&mut self, handler: DiagnosticHandler) {
        self.diagnostics.on_diagnostic(handler);
    }

    /// Transport entry point. Never blocks; returns the number of records
    /// extracted from the chunk.
    pub fn on_bytes_received(&mut self, chunk: &[u8]) -> usize {
        self.on_bytes_received_at(chunk, Instant::now())
    }

    /// [`Self::on_bytes_received`] with an explicit clock.
    pub fn on_bytes_received_at(&mut self, chunk: &[u8], now: Instant) -> usize {
        let outcome = self.ingest.append(chunk);

        if let Some(m) = self.metrics.as_deref() {
            m.chunks_received.inc();
            m.bytes_received.inc_by(chunk.len() as f64);
            if outcome.evicted > 0 {
                m.bytes_dropped.inc_by(outcome.evicted as f64);
            }
        }

        if outcome.evicted > 0 {
            self.note_overrun(outcome.evicted);
        }

        self.drain_ingest(now)
    }

    /// Host notification entry point.
    pub fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Ready(name) => self.windows.on_ready(&name, &mut self.host),
            HostEvent::Closed(name) => {
                self.windows
                    .on_closed(&name, &mut self.host, &self.diagnostics)
            }
        }
    }

    /// Periodic work at the processing interval: backlog retry, slow
    /// consumer and exhaustion reports, host and log flushes.
    ///
    /// Returns the interval until the next tick.
    pub fn tick(&mut self, now: Instant) -> Duration {
        let mut consumers = Consumers {
            log: &mut self.log,
            windows: &mut self.windows,
            host: &mut self.host,
            diagnostics: &self.diagnostics,
        };
        self.router.tick(now, &mut consumers);
        self.drain_ingest(now);
        let interval = self.router.interval();

        self.host.flush();
        if let Err(e) = self.log.flush() {
            warn!(sink = self.log.name(), error = %e, "log flush failed");
        }

        self.update_gauges();
        interval
    }

    /// Releases a slot the log sink kept with [`crate::pool::Lease::hold`].
    ///
    /// A freed slot lets deferred records and buffered lines move again.
    pub fn release(&mut self, handle: SlotHandle, consumer: ConsumerId) -> bool {
        self.release_at(handle, consumer, Instant::now())
    }

    /// [`Self::release`] with an explicit clock.
    pub fn release_at(&mut self, handle: SlotHandle, consumer: ConsumerId, now: Instant) -> bool {
        let freed = self.router.release(handle, consumer, &self.diagnostics);
        if freed {
            self.drain_ingest(now);
        }
        freed
    }

    /// Stops the pipeline: one last backlog retry, then whatever is still
    /// waiting is discarded and the log is flushed.
    pub fn shutdown(&mut self, now: Instant) -> ShutdownReport {
        self.tick(now);

        let report = ShutdownReport {
            backlog_discarded: self.router.discard_backlog(),
            pending_discarded: self.windows.shutdown(),
            unterminated_bytes: self.ingest.len(),
        };

        if let Err(e) = self.log.flush() {
            warn!(sink = self.log.name(), error = %e, "final log flush failed");
        }

        info!(
            routed = self.router.routed(),
            backlog_discarded = report.backlog_discarded,
            pending_discarded = report.pending_discarded,
            unterminated_bytes = report.unterminated_bytes,
            dropped_bytes = self.ingest.dropped_bytes(),
            "pipeline stopped"
        );

        report
    }

    pub fn interval(&self) -> Duration {
        self.router.interval()
    }

    pub fn ingest(&self) -> &IngestBuffer {
        &self.ingest
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn windows(&self) -> &WindowCommandDispatcher {
        &self.windows
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Shared per-kind record counters.
    pub fn stats(&self) -> Arc<RecordStats> {
        Arc::clone(&self.stats)
    }

    /// Extracts and routes buffered lines until the ring has no complete
    /// line left or the router starts deferring. While a record waits for a
    /// pool slot extraction stops, so the bytes behind it stay in the ring
    /// and sustained exhaustion degrades through eviction.
    fn drain_ingest(&mut self, now: Instant) -> usize {
        let Self {
            ingest,
            extractor,
            router,
            windows,
            log,
            host,
            diagnostics,
            stats,
            metrics,
            overrun,
        } = self;

        let mut consumers = Consumers {
            log,
            windows,
            host,
            diagnostics,
        };

        let extracted = if router.retry_backlog(&mut consumers, now) {
            ingest.drain_lines_while(extractor, |record| {
                if !record.corrupted {
                    if let Some(dropped) = overrun.take() {
                        info!(dropped_bytes = dropped, "ingest overrun ended");
                    }
                }

                stats.record(record.kind, record.byte_len);
                let started = Instant::now();
                let outcome = router.route(record, &mut consumers, now);
                if let Some(m) = metrics.as_deref() {
                    m.records_by_kind
                        .with_label_values(&[record.kind.as_str()])
                        .inc();
                    m.record_processing_duration
                        .observe(started.elapsed().as_secs_f64());
                }
                outcome == RouteOutcome::Routed
            })
        } else {
            0
        };

        router.end_batch(now);
        extracted
    }

    /// One diagnostic per overrun episode; later evictions in the same
    /// episode only add to its byte count.
    fn note_overrun(&mut self, evicted: usize) {
        match &mut self.overrun {
            Some(dropped) => *dropped += evicted,
            None => {
                self.overrun = Some(evicted);
                self.diagnostics.emit(Diagnostic::BufferOverflow {
                    dropped_bytes: evicted,
                });
            }
        }
    }

    fn update_gauges(&self) {
        let Some(m) = &self.metrics else {
            return;
        };

        m.ingest_buffered_bytes.set(self.ingest.len() as f64);
        m.pool_slots_in_use.set(self.router.pool().in_use() as f64);
        m.pool_backlog.set(self.router.backlog_len() as f64);
        m.pacing_interval.set(self.router.interval().as_secs_f64());

        let registry = self.windows.registry();
        for state in WindowState::all() {
            m.windows_by_state
                .with_label_values(&[state.as_str()])
                .set(registry.count_by_state(*state) as f64);
        }
    }
}
