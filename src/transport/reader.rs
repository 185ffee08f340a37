use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::InputSource;

use super::{RawChunk, Transport};

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Transport over any async byte reader: stdin, a capture file, or a TCP
/// serial bridge.
pub struct ReaderTransport {
    source: InputSource,
    read_size: usize,
    bytes_read: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ReaderTransport {
    pub fn new(source: InputSource, read_size: usize) -> Self {
        Self {
            source,
            read_size: read_size.max(1),
            bytes_read: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// Total bytes forwarded so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    async fn open(&self) -> Result<BoxedReader> {
        let reader: BoxedReader = match &self.source {
            InputSource::Stdin => Box::new(tokio::io::stdin()),
            InputSource::File(path) => Box::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening capture file {}", path.display()))?,
            ),
            InputSource::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connecting to {addr}"))?;
                stream.set_nodelay(true).context("setting TCP_NODELAY")?;
                Box::new(stream)
            }
        };
        Ok(reader)
    }
}

impl Transport for ReaderTransport {
    fn name(&self) -> &str {
        "reader"
    }

    async fn start(&mut self, ctx: CancellationToken, chunks: mpsc::Sender<RawChunk>) -> Result<()> {
        let reader = self.open().await?;

        info!(source = %self.source, read_size = self.read_size, "transport opened");

        self.task = Some(tokio::spawn(forward(
            reader,
            self.read_size,
            ctx,
            chunks,
            Arc::clone(&self.bytes_read),
        )));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "transport task ended abnormally");
            }
        }

        info!(bytes = self.bytes_read(), "transport stopped");

        Ok(())
    }
}

async fn forward(
    mut reader: BoxedReader,
    read_size: usize,
    ctx: CancellationToken,
    chunks: mpsc::Sender<RawChunk>,
    bytes_read: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; read_size];

    loop {
        let n = tokio::select! {
            _ = ctx.cancelled() => return,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    info!("transport reached end of input");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "transport read failed");
                    return;
                }
            },
        };

        bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        tokio::select! {
            _ = ctx.cancelled() => return,
            sent = chunks.send(buf[..n].to_vec()) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
