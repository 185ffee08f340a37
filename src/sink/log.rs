use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{error, info};

use crate::config::LogSinkConfig;
use crate::extract::DecodedRecord;
use crate::pool::Lease;

use super::LogSink;

/// Prefix written before a line that followed an ingest overrun.
pub const DESYNC_MARKER: &[u8] = b"~~ ";

/// Boxed writer used when the destination is chosen at runtime.
pub type DynWriter = Box<dyn Write + Send>;

/// Plain line writer for every decoded record.
pub struct TextLogSink<W: Write> {
    out: BufWriter<W>,
    timestamps: bool,
    lines: u64,
    write_errors: u64,
}

impl<W: Write> TextLogSink<W> {
    pub fn new(out: W, timestamps: bool) -> Self {
        Self {
            out: BufWriter::new(out),
            timestamps,
            lines: 0,
            write_errors: 0,
        }
    }

    /// Lines written successfully.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.out.into_inner().map_err(|e| e.into_error())
    }

    fn write_line(&mut self, record: &DecodedRecord) -> io::Result<()> {
        if self.timestamps {
            write!(self.out, "{} ", Local::now().format("%H:%M:%S%.3f"))?;
        }
        if record.corrupted {
            self.out.write_all(DESYNC_MARKER)?;
        }
        self.out.write_all(record.raw_text.as_bytes())?;
        self.out.write_all(b"\n")
    }
}

impl TextLogSink<DynWriter> {
    /// Builds the sink described by `cfg`. A disabled sink still consumes
    /// records but discards the output.
    pub fn from_config(cfg: &LogSinkConfig) -> Result<Self> {
        let out: DynWriter = match (&cfg.path, cfg.enabled) {
            (_, false) => Box::new(io::sink()),
            (Some(path), true) => Box::new(open_append(path)?),
            (None, true) => Box::new(io::stdout()),
        };

        info!(
            enabled = cfg.enabled,
            path = ?cfg.path,
            timestamps = cfg.timestamps,
            "text log sink configured"
        );

        Ok(Self::new(out, cfg.timestamps))
    }
}

fn open_append(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

impl<W: Write> LogSink for TextLogSink<W> {
    fn name(&self) -> &str {
        "text"
    }

    fn record(&mut self, lease: Lease<'_>) {
        match self.write_line(lease.record()) {
            Ok(()) => self.lines += 1,
            Err(e) => {
                self.write_errors += 1;
                // Only the first failure is logged.
                if self.write_errors == 1 {
                    error!(sink = "text", error = %e, "log write failed");
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
