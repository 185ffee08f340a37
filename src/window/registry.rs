use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::extract::DecodedRecord;

use super::command::WindowType;

/// Lifecycle of a window instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowState {
    Creating,
    AwaitingReady,
    Ready,
    Closed,
}

impl WindowState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }

    /// Whether records addressed to the instance are still accepted.
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Closed)
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Creating,
            Self::AwaitingReady,
            Self::Ready,
            Self::Closed,
        ]
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry bookkeeping for one named instance.
#[derive(Debug)]
pub struct WindowRegistryEntry {
    /// Name as first written on the wire.
    pub instance_name: String,
    pub window_type: WindowType,
    pub state: WindowState,
    /// Records waiting for the instance to become ready, in arrival order.
    pub pending_queue: VecDeque<DecodedRecord>,
    /// Creation command parked while the previous instance of this name is
    /// still being torn down. Replayed once the host confirms the close.
    pub reopen: Option<String>,
}

/// Owned map of window instances keyed by case-insensitive name.
#[derive(Debug, Default)]
pub struct WindowRegistry {
    entries: HashMap<String, WindowRegistryEntry>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&WindowRegistryEntry> {
        self.entries.get(LookupKey::new(name).as_str())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WindowRegistryEntry> {
        self.entries.get_mut(LookupKey::new(name).as_str())
    }

    /// Whether `name` is registered and not closed.
    pub fn is_live(&self, name: &str) -> bool {
        self.get(name).is_some_and(|e| e.state.is_live())
    }

    /// Registers a new instance in `Creating`. Returns `None` when the name
    /// is already taken.
    pub fn insert(
        &mut self,
        name: &str,
        window_type: WindowType,
    ) -> Option<&mut WindowRegistryEntry> {
        match self.entries.entry(key(name)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(WindowRegistryEntry {
                instance_name: name.to_string(),
                window_type,
                state: WindowState::Creating,
                pending_queue: VecDeque::new(),
                reopen: None,
            })),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<WindowRegistryEntry> {
        self.entries.remove(LookupKey::new(name).as_str())
    }

    /// Number of instances in each state.
    pub fn count_by_state(&self, state: WindowState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WindowRegistryEntry> {
        self.entries.values_mut()
    }
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

const INLINE_KEY_LEN: usize = 64;

/// Lowercased name for map lookups. Names up to `INLINE_KEY_LEN` bytes stay
/// on the stack so routing to a window does not allocate.
enum LookupKey {
    Inline([u8; INLINE_KEY_LEN], usize),
    Heap(String),
}

impl LookupKey {
    fn new(name: &str) -> Self {
        let len = name.len();
        if len > INLINE_KEY_LEN {
            return Self::Heap(key(name));
        }
        let mut buf = [0u8; INLINE_KEY_LEN];
        buf[..len].copy_from_slice(name.as_bytes());
        buf[..len].make_ascii_lowercase();
        Self::Inline(buf, len)
    }

    fn as_str(&self) -> &str {
        match self {
            // ASCII lowercasing keeps UTF-8 valid.
            Self::Inline(buf, len) => std::str::from_utf8(&buf[..*len]).unwrap_or_default(),
            Self::Heap(name) => name,
        }
    }
}
