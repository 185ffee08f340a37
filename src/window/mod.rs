//! Window command dispatch.
//!
//! Interprets backtick records, owns the registry of window instances, and
//! drives each instance through `Creating -> AwaitingReady -> Ready -> Closed`.
//! Records for an instance that is not ready yet are parked in its pending
//! queue and flushed in arrival order once the host reports it ready.

pub mod command;
pub mod registry;

use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::extract::DecodedRecord;
use crate::pool::Lease;
use crate::sink::WindowHost;

use self::command::{CommandError, Token, WindowType, CLOSE_VERB};
use self::registry::{WindowRegistry, WindowState};

/// Notifications from the window host back into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Construction finished; queued records may be delivered.
    Ready(String),
    /// The instance is gone (teardown confirmed or closed by the user).
    Closed(String),
}

/// Routes window commands to named instances.
#[derive(Debug, Default)]
pub struct WindowCommandDispatcher {
    registry: WindowRegistry,
    delivered: u64,
}

impl WindowCommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &WindowRegistry {
        &self.registry
    }

    /// Lifecycle state of an instance, if registered.
    pub fn state(&self, name: &str) -> Option<WindowState> {
        self.registry.get(name).map(|e| e.state)
    }

    /// Total records delivered to ready instances.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Consumer entry point: dispatch the leased record, then release it.
    pub fn handle(
        &mut self,
        lease: Lease<'_>,
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        self.dispatch(lease.record(), host, diagnostics);
        if let Err(error) = lease.release() {
            diagnostics.emit(Diagnostic::InvalidRelease { error });
        }
    }

    /// Interprets one backtick record.
    pub fn dispatch(
        &mut self,
        record: &DecodedRecord,
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        let tokens = match command::command_body(&record.raw_text).and_then(command::tokenize) {
            Ok(tokens) => tokens,
            Err(error) => {
                diagnostics.emit(unparseable(record, error));
                return;
            }
        };

        let Some(first) = tokens[0].as_word() else {
            diagnostics.emit(unparseable(
                record,
                CommandError::ExpectedName {
                    found: tokens[0].to_string(),
                },
            ));
            return;
        };

        // Leading names of live instances all receive the record.
        let target_count = tokens
            .iter()
            .take_while(|t| t.as_word().is_some_and(|w| self.registry.is_live(w)))
            .count();

        if target_count > 0 {
            let args = &tokens[target_count..];
            let closing = args.len() == 1 && args[0].is_word(CLOSE_VERB);
            for name in tokens[..target_count].iter().filter_map(Token::as_word) {
                if closing {
                    self.close(name, host);
                } else {
                    self.forward(name, record, host);
                }
            }
            return;
        }

        let Some(window_type) = WindowType::from_keyword(first) else {
            diagnostics.emit(Diagnostic::UnknownWindow {
                name: first.to_string(),
            });
            return;
        };

        let Some(name) = tokens.get(1).and_then(Token::as_word) else {
            diagnostics.emit(unparseable(
                record,
                CommandError::MissingInstanceName { window_type },
            ));
            return;
        };

        let params = &tokens[2..];
        if params.len() == 1 && params[0].is_word(CLOSE_VERB) {
            if self.registry.is_live(name) {
                self.close(name, host);
            } else {
                diagnostics.emit(Diagnostic::UnknownWindow {
                    name: name.to_string(),
                });
            }
            return;
        }

        self.create(window_type, name, params, record, host, diagnostics);
    }

    /// Host reported the instance constructed.
    pub fn on_ready(&mut self, name: &str, host: &mut dyn WindowHost) {
        let Some(entry) = self.registry.get_mut(name) else {
            debug!(window = name, "ready for unknown window ignored");
            return;
        };

        if !matches!(
            entry.state,
            WindowState::Creating | WindowState::AwaitingReady
        ) {
            debug!(window = name, state = %entry.state, "duplicate ready ignored");
            return;
        }
        if entry.reopen.is_some() {
            debug!(window = name, "ready from the instance being torn down ignored");
            return;
        }

        entry.state = WindowState::Ready;
        let flushed = entry.pending_queue.len();
        for record in entry.pending_queue.drain(..) {
            host.deliver(&entry.instance_name, &record);
        }
        self.delivered += flushed as u64;

        debug!(window = %entry.instance_name, flushed, "window ready");
    }

    /// Host reported the instance gone. A creation parked behind the
    /// teardown is requested now.
    pub fn on_closed(
        &mut self,
        name: &str,
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        let parked = self
            .registry
            .get_mut(name)
            .and_then(|entry| entry.reopen.take());
        if let Some(command) = parked {
            self.reopen(name, &command, host, diagnostics);
            return;
        }

        match self.registry.remove(name) {
            Some(entry) => info!(
                window = %entry.instance_name,
                window_type = %entry.window_type,
                state = %entry.state,
                discarded = entry.pending_queue.len(),
                "window removed",
            ),
            None => debug!(window = name, "close for unknown window ignored"),
        }
    }

    /// Drops records still waiting for instances that never became ready.
    ///
    /// Returns how many records were discarded.
    pub fn shutdown(&mut self) -> usize {
        let mut discarded = 0;
        for entry in self.registry.iter_mut() {
            discarded += entry.pending_queue.len();
            entry.pending_queue.clear();
        }
        if discarded > 0 {
            info!(discarded, "discarded records queued for windows that never became ready");
        }
        discarded
    }

    fn create(
        &mut self,
        window_type: WindowType,
        name: &str,
        params: &[Token<'_>],
        record: &DecodedRecord,
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        match self.registry.get_mut(name) {
            None => {}
            // The old instance is still closing; build the new one after it.
            Some(entry) if entry.state == WindowState::Closed => {
                entry.instance_name = name.to_string();
                entry.window_type = window_type;
                entry.state = WindowState::Creating;
                entry.reopen = Some(record.raw_text.clone());
                debug!(window = name, window_type = %window_type, "creation parked until teardown completes");
                return;
            }
            Some(_) => {
                diagnostics.emit(Diagnostic::DuplicateInstance {
                    name: name.to_string(),
                });
                return;
            }
        }

        self.registry.insert(name, window_type);
        self.request_construction(window_type, name, params, host, diagnostics);
    }

    /// Replays a parked creation command.
    fn reopen(
        &mut self,
        name: &str,
        command: &str,
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        let Some((window_type, instance)) = self
            .registry
            .get(name)
            .map(|e| (e.window_type, e.instance_name.clone()))
        else {
            return;
        };

        match command::command_body(command).and_then(command::tokenize) {
            Ok(tokens) => {
                let params = tokens.get(2..).unwrap_or(&[]);
                info!(window = %instance, window_type = %window_type, "re-creating window after teardown");
                self.request_construction(window_type, &instance, params, host, diagnostics);
            }
            Err(error) => {
                self.registry.remove(name);
                diagnostics.emit(Diagnostic::UnparseableCommand {
                    text: command.to_string(),
                    error,
                });
            }
        }
    }

    /// Asks the host to build a registered `Creating` instance.
    fn request_construction(
        &mut self,
        window_type: WindowType,
        name: &str,
        params: &[Token<'_>],
        host: &mut dyn WindowHost,
        diagnostics: &Diagnostics,
    ) {
        match host.create(window_type, name, params) {
            Ok(()) => {
                if let Some(entry) = self.registry.get_mut(name) {
                    entry.state = WindowState::AwaitingReady;
                }
                info!(window = name, window_type = %window_type, "window requested");
            }
            Err(e) => {
                self.registry.remove(name);
                diagnostics.emit(Diagnostic::WindowCreateFailed {
                    window_type,
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn forward(&mut self, name: &str, record: &DecodedRecord, host: &mut dyn WindowHost) {
        let Some(entry) = self.registry.get_mut(name) else {
            return;
        };

        match entry.state {
            WindowState::Creating | WindowState::AwaitingReady => {
                entry.pending_queue.push_back(record.clone());
                // A parked instance does not exist on the host yet.
                if entry.reopen.is_none() {
                    host.enqueue(&entry.instance_name, record);
                }
            }
            WindowState::Ready => {
                host.deliver(&entry.instance_name, record);
                self.delivered += 1;
            }
            WindowState::Closed => {}
        }
    }

    fn close(&mut self, name: &str, host: &mut dyn WindowHost) {
        let Some(entry) = self.registry.get_mut(name) else {
            return;
        };
        if entry.state == WindowState::Closed {
            return;
        }

        if entry.reopen.take().is_some() {
            // Cancels a parked creation; the host is already closing the name.
            entry.state = WindowState::Closed;
            entry.pending_queue.clear();
            debug!(window = %entry.instance_name, "parked creation cancelled");
            return;
        }

        entry.state = WindowState::Closed;
        let discarded = entry.pending_queue.len();
        entry.pending_queue.clear();
        host.close(&entry.instance_name);

        debug!(window = %entry.instance_name, discarded, "window closing");
    }
}

fn unparseable(record: &DecodedRecord, error: CommandError) -> Diagnostic {
    Diagnostic::UnparseableCommand {
        text: record.raw_text.clone(),
        error,
    }
}
