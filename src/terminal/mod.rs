use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, InputSource};
use crate::export::health::HealthMetrics;
use crate::ingest::stats::RecordStats;
use crate::pipeline::{Pipeline, ShutdownReport};
use crate::sink::headless::HeadlessWindowHost;
use crate::sink::log::TextLogSink;
use crate::sink::{LogSink, WindowHost};
use crate::transport::{RawChunk, ReaderTransport, Transport};
use crate::window::HostEvent;

/// Host notifications buffered between the window host and the pipeline.
const HOST_EVENT_CAPACITY: usize = 256;

/// Terminal orchestrates the components: transport, pipeline loop, health
/// server and stats reporter.
pub struct Terminal {
    cfg: Config,
    source: InputSource,
    health: Option<Arc<HealthMetrics>>,
    transport: Option<ReaderTransport>,
    pipeline_task: Option<JoinHandle<ShutdownReport>>,
    input_closed: CancellationToken,
    cancel: CancellationToken,
}

impl Terminal {
    /// Creates a new Terminal, initializing health metrics when enabled.
    pub fn new(cfg: Config) -> Result<Self> {
        let source = InputSource::parse(&cfg.transport.source)
            .with_context(|| format!("transport.source {:?}", cfg.transport.source))?;

        let health = if cfg.health.enabled {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        Ok(Self {
            cfg,
            source,
            health,
            transport: None,
            pipeline_task: None,
            input_closed: CancellationToken::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(self.cfg.transport.channel_capacity);
        let (host_tx, host_rx) = mpsc::channel(HOST_EVENT_CAPACITY);

        let log = TextLogSink::from_config(&self.cfg.log_sink).context("creating log sink")?;
        let host = HeadlessWindowHost::new(host_tx);
        let mut pipeline = Pipeline::new(&self.cfg, log, host);
        if let Some(health) = &self.health {
            pipeline = pipeline.with_metrics(Arc::clone(health));
        }
        let stats = pipeline.stats();

        let mut transport = ReaderTransport::new(self.source.clone(), self.cfg.transport.read_size);
        transport
            .start(self.cancel.child_token(), chunk_tx)
            .await
            .with_context(|| format!("starting transport {}", transport.name()))?;
        self.transport = Some(transport);

        self.pipeline_task = Some(tokio::spawn(run_pipeline(
            pipeline,
            chunk_rx,
            host_rx,
            self.cancel.clone(),
            self.input_closed.clone(),
        )));

        self.spawn_stats_reporter(stats);

        info!(
            source = %self.source,
            ingest_capacity = self.cfg.ingest.capacity,
            pool_slots = self.cfg.pool.slots,
            "terminal started"
        );

        Ok(())
    }

    /// Resolves once the transport has delivered its last byte.
    pub async fn input_closed(&self) {
        self.input_closed.cancelled().await;
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<Option<ShutdownReport>> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(transport) = &mut self.transport {
            if let Err(e) = transport.stop().await {
                error!(error = %e, "error stopping transport");
            }
        }

        let report = match self.pipeline_task.take() {
            Some(task) => Some(task.await.context("joining pipeline task")?),
            None => None,
        };

        if let Some(health) = &self.health {
            health.stop().await?;
        }

        Ok(report)
    }

    /// Spawn background record stats reporter.
    fn spawn_stats_reporter(&self, stats: Arc<RecordStats>) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let (by_kind, bytes) = stats.snapshot();
                        let total: u64 = by_kind.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(records = total, bytes, interval = ?interval, "record stats");

                        for (kind, count) in &by_kind {
                            debug!(kind = %kind, count, "  by kind");
                        }
                    }
                }
            }
        });
    }
}

/// The single execution context that owns the pipeline.
///
/// Chunks, host notifications and the pacing timer are all served here, so
/// the pipeline itself is never shared.
pub async fn run_pipeline<L: LogSink, H: WindowHost>(
    mut pipeline: Pipeline<L, H>,
    mut chunks: mpsc::Receiver<RawChunk>,
    mut host_events: mpsc::Receiver<HostEvent>,
    cancel: CancellationToken,
    input_closed: CancellationToken,
) -> ShutdownReport {
    let pacing = tokio::time::sleep(pipeline.interval());
    tokio::pin!(pacing);
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = chunks.recv(), if input_open => match chunk {
                Some(chunk) => {
                    pipeline.on_bytes_received(&chunk);
                }
                None => {
                    input_open = false;
                    // Flush what the last chunk produced before reporting.
                    pipeline.tick(Instant::now());
                    info!("transport closed, ingestion stopped");
                    input_closed.cancel();
                }
            },
            Some(event) = host_events.recv() => pipeline.on_host_event(event),
            _ = &mut pacing => {
                let next = pipeline.tick(Instant::now());
                pacing.as_mut().reset(tokio::time::Instant::now() + next);
            }
        }
    }

    pipeline.shutdown(Instant::now())
}
