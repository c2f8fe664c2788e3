//! In-memory (person, source) debounce.
//!
//! State lives only for the process lifetime: after a restart the first
//! sighting of every key is accepted again, even if one was recorded just
//! before shutdown.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Default minimum spacing between two accepted events for the same key.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);

pub struct DebounceCache {
    window_secs: f64,
    last_accepted: Mutex<HashMap<(String, String), f64>>,
}

impl Default for DebounceCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_WINDOW)
    }
}

impl DebounceCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs_f64(),
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs)
    }

    /// Decide whether an event at `timestamp` (seconds since the Unix epoch)
    /// should be recorded, and remember it if so.
    ///
    /// Accepts when the key has never been accepted, or when at least one full
    /// window has elapsed since the last acceptance. Timestamps older than the
    /// last accepted one count as inside the window. Check and update happen
    /// under one lock, so concurrent callers on the same key cannot both win.
    pub fn should_accept(&self, person: &str, source: &str, timestamp: f64) -> bool {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let key = (person.to_string(), source.to_string());
        if let Some(&prev) = last.get(&key) {
            if timestamp - prev < self.window_secs {
                return false;
            }
        }
        last.insert(key, timestamp);
        true
    }

    /// Forget an acceptance that could not be recorded.
    ///
    /// Only removes the key if `timestamp` is still the latest acceptance, so
    /// a newer winner on the same key is left alone.
    pub fn revoke(&self, person: &str, source: &str, timestamp: f64) {
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let key = (person.to_string(), source.to_string());
        if last.get(&key) == Some(&timestamp) {
            last.remove(&key);
        }
    }

    /// Number of distinct keys currently remembered.
    pub fn len(&self) -> usize {
        self.last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
