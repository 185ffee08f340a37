pub mod headless;
pub mod log;

use thiserror::Error;

use crate::extract::DecodedRecord;
use crate::pool::Lease;
use crate::window::command::{Token, WindowType};

/// LogSink receives every decoded record for durable logging.
pub trait LogSink {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Consume one record. Dropping the lease releases the slot; call
    /// [`Lease::hold`] to keep it and release through the pipeline later.
    fn record(&mut self, lease: Lease<'_>);

    /// Push buffered output to its destination.
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Errors a window host reports back to the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("window construction rejected: {reason}")]
    Rejected { reason: String },
}

/// WindowHost owns the window instances the dispatcher addresses.
///
/// Calls are fire-and-forget from the pipeline's point of view. The host
/// reports readiness and teardown asynchronously through
/// [`crate::window::HostEvent`]s fed back into the pipeline.
pub trait WindowHost {
    /// Request construction of a new instance.
    fn create(
        &mut self,
        window_type: WindowType,
        name: &str,
        params: &[Token<'_>],
    ) -> Result<(), HostError>;

    /// A record was parked for an instance that is not ready yet.
    fn enqueue(&mut self, _name: &str, _record: &DecodedRecord) {}

    /// Deliver a record to a ready instance.
    fn deliver(&mut self, name: &str, record: &DecodedRecord);

    /// Request teardown of an instance.
    fn close(&mut self, name: &str);

    /// Apply batched updates; called at the router's processing interval.
    fn flush(&mut self) {}
}
