//! Streaming message pipeline for a Propeller 2 serial debug terminal.
//!
//! Bytes from the device flow through [`ingest::IngestBuffer`] and
//! [`extract::MessageExtractor`] into typed records, which the
//! [`router::MessageRouter`] fans out through a fixed [`pool::MessagePool`]
//! to the log sink and the [`window::WindowCommandDispatcher`].
//! [`pipeline::Pipeline`] owns the whole core; [`terminal::Terminal`] runs it
//! on tokio.

pub mod config;
pub mod diagnostics;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod pipeline;
pub mod pool;
pub mod router;
pub mod sink;
pub mod terminal;
pub mod transport;
pub mod window;
