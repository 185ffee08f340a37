pub mod reader;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use self::reader::ReaderTransport;

/// Raw bytes as delivered by a transport read.
pub type RawChunk = Vec<u8>;

/// Transport delivers the device byte stream to the pipeline.
///
/// Chunks are pushed into the channel in arrival order. Dropping the sender
/// (end of input, connection closed, read error) tells the pipeline that
/// ingestion has stopped.
pub trait Transport: Send {
    /// Returns the transport's name for logging.
    fn name(&self) -> &str;

    /// Open the source and start forwarding chunks until `ctx` is cancelled
    /// or the input ends.
    fn start(
        &mut self,
        ctx: CancellationToken,
        chunks: mpsc::Sender<RawChunk>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for the forwarding task to finish.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
