//! Structured diagnostics for conditions the pipeline absorbs.
//!
//! Nothing in the core unwinds on overruns, bad commands, pool pressure or
//! slow consumers. Each condition becomes a [`Diagnostic`] emitted through
//! [`Diagnostics::emit`], which logs it and fans it out to registered
//! handlers (metrics, tests).

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::pool::{ConsumerSet, PoolError};
use crate::window::command::{CommandError, WindowType};

/// Callback for emitted diagnostics.
pub type DiagnosticHandler = Box<dyn Fn(&Diagnostic) + Send + Sync>;

/// Label for a diagnostic, used by metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    BufferOverflow,
    UnparseableCommand,
    UnknownWindow,
    DuplicateInstance,
    WindowCreateFailed,
    PoolExhausted,
    SlowConsumer,
    InvalidRelease,
}

impl DiagnosticKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BufferOverflow => "buffer_overflow",
            Self::UnparseableCommand => "unparseable_command",
            Self::UnknownWindow => "unknown_window",
            Self::DuplicateInstance => "duplicate_instance",
            Self::WindowCreateFailed => "window_create_failed",
            Self::PoolExhausted => "pool_exhausted",
            Self::SlowConsumer => "slow_consumer",
            Self::InvalidRelease => "invalid_release",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::BufferOverflow,
            Self::UnparseableCommand,
            Self::UnknownWindow,
            Self::DuplicateInstance,
            Self::WindowCreateFailed,
            Self::PoolExhausted,
            Self::SlowConsumer,
            Self::InvalidRelease,
        ]
    }
}

/// A condition the pipeline absorbed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    #[error("ingest buffer overrun: {dropped_bytes} bytes dropped, next line flagged")]
    BufferOverflow { dropped_bytes: usize },

    #[error("unparseable window command {text:?}: {error}")]
    UnparseableCommand { text: String, error: CommandError },

    #[error("unsupported window/command: no live instance or window type named {name:?}")]
    UnknownWindow { name: String },

    #[error("window instance {name:?} already exists")]
    DuplicateInstance { name: String },

    #[error("host failed to create {window_type} window {name:?}: {reason}")]
    WindowCreateFailed {
        window_type: WindowType,
        name: String,
        reason: String,
    },

    #[error("message pool exhausted for {duration:?}, {backlog} records waiting")]
    PoolExhausted { backlog: usize, duration: Duration },

    #[error("slow consumer: slot {slot} (sequence {sequence}) held by {holders} for {held_for:?}")]
    SlowConsumer {
        slot: u32,
        sequence: u64,
        holders: ConsumerSet,
        held_for: Duration,
    },

    #[error("invalid slot release: {error}")]
    InvalidRelease { error: PoolError },
}

impl Diagnostic {
    pub const fn kind(&self) -> DiagnosticKind {
        match self {
            Self::BufferOverflow { .. } => DiagnosticKind::BufferOverflow,
            Self::UnparseableCommand { .. } => DiagnosticKind::UnparseableCommand,
            Self::UnknownWindow { .. } => DiagnosticKind::UnknownWindow,
            Self::DuplicateInstance { .. } => DiagnosticKind::DuplicateInstance,
            Self::WindowCreateFailed { .. } => DiagnosticKind::WindowCreateFailed,
            Self::PoolExhausted { .. } => DiagnosticKind::PoolExhausted,
            Self::SlowConsumer { .. } => DiagnosticKind::SlowConsumer,
            Self::InvalidRelease { .. } => DiagnosticKind::InvalidRelease,
        }
    }
}

/// The single emission point for diagnostics.
#[derive(Default)]
pub struct Diagnostics {
    handlers: Vec<DiagnosticHandler>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler invoked for every emitted diagnostic.
    pub fn on_diagnostic(&mut self, handler: DiagnosticHandler) {
        self.handlers.push(handler);
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        warn!(kind = diagnostic.kind().as_str(), "{diagnostic}");
        for handler in &self.handlers {
            handler(&diagnostic);
        }
    }
}
