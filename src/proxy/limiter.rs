//! Per-downstream admission limiting.
//!
//! A single map of identity to live connection count, guarded by one lock.
//! The cap is supplied per call rather than stored, so a policy change takes
//! effect without touching the map.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counts live admitted connections per downstream identity.
#[derive(Debug, Default)]
pub struct AdmissionLimiter {
    counts: Mutex<HashMap<String, u32>>,
}

impl AdmissionLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one connection for `downstream` if it is below `max`.
    ///
    /// Returns whether the connection was admitted. A downstream with no
    /// history counts as zero. Every `true` must eventually be paired with
    /// one `release`.
    pub fn try_admit(&self, downstream: &str, max: u32) -> bool {
        let mut counts = self.counts.lock().expect("limiter lock");
        let count = counts.entry(downstream.to_string()).or_insert(0);
        if *count < max {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Record the end of one previously admitted connection.
    pub fn release(&self, downstream: &str) {
        let mut counts = self.counts.lock().expect("limiter lock");
        let Some(count) = counts.get_mut(downstream) else {
            debug_assert!(false, "release without a matching admit");
            return;
        };
        debug_assert!(*count > 0, "release without a matching admit");
        *count = count.saturating_sub(1);
    }

    /// Current live count for `downstream`.
    pub fn current(&self, downstream: &str) -> u32 {
        self.counts
            .lock()
            .expect("limiter lock")
            .get(downstream)
            .copied()
            .unwrap_or(0)
    }
}
