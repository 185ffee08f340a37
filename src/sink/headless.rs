use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::extract::DecodedRecord;
use crate::window::command::{Token, WindowType};
use crate::window::HostEvent;

use super::{HostError, WindowHost};

/// Per-instance bookkeeping of the headless host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessWindow {
    pub window_type: WindowType,
    pub params: Vec<String>,
    /// Records parked by the dispatcher before the window was ready.
    pub enqueued: u64,
    pub delivered: u64,
    /// Deliveries since the last flush.
    pending_updates: u64,
}

/// Window host without a display.
///
/// Acknowledges construction and teardown through the host event channel,
/// exactly like a rendering host would, and counts what each instance
/// received. Flushes are logged at debug level.
pub struct HeadlessWindowHost {
    events: mpsc::Sender<HostEvent>,
    windows: HashMap<String, HeadlessWindow>,
    refreshes: u64,
}

impl HeadlessWindowHost {
    pub fn new(events: mpsc::Sender<HostEvent>) -> Self {
        Self {
            events,
            windows: HashMap::new(),
            refreshes: 0,
        }
    }

    pub fn window(&self, name: &str) -> Option<&HeadlessWindow> {
        self.windows.get(name)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Window refreshes performed by `flush`.
    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }
}

impl WindowHost for HeadlessWindowHost {
    fn create(
        &mut self,
        window_type: WindowType,
        name: &str,
        params: &[Token<'_>],
    ) -> Result<(), HostError> {
        self.events
            .try_send(HostEvent::Ready(name.to_string()))
            .map_err(|e| HostError::Rejected {
                reason: format!("host event channel unavailable: {e}"),
            })?;

        self.windows.insert(
            name.to_string(),
            HeadlessWindow {
                window_type,
                params: params.iter().map(ToString::to_string).collect(),
                enqueued: 0,
                delivered: 0,
                pending_updates: 0,
            },
        );

        info!(window = name, window_type = %window_type, params = params.len(), "headless window created");

        Ok(())
    }

    fn enqueue(&mut self, name: &str, _record: &DecodedRecord) {
        if let Some(window) = self.windows.get_mut(name) {
            window.enqueued += 1;
        }
    }

    fn deliver(&mut self, name: &str, _record: &DecodedRecord) {
        match self.windows.get_mut(name) {
            Some(window) => {
                window.delivered += 1;
                window.pending_updates += 1;
            }
            None => debug!(window = name, "delivery to unknown headless window"),
        }
    }

    fn close(&mut self, name: &str) {
        if let Some(window) = self.windows.remove(name) {
            debug!(window = name, delivered = window.delivered, "headless window closed");
        }
        if self
            .events
            .try_send(HostEvent::Closed(name.to_string()))
            .is_err()
        {
            warn!(window = name, "host event channel full, close confirmation lost");
        }
    }

    fn flush(&mut self) {
        for (name, window) in &mut self.windows {
            if window.pending_updates == 0 {
                continue;
            }
            debug!(window = %name, updates = window.pending_updates, "window refresh");
            window.pending_updates = 0;
            self.refreshes += 1;
        }
    }
}
