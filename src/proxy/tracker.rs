//! Per-group upstream tracking and least-connections selection.
//!
//! A tracker owns every upstream of one group for its whole lifetime and a
//! min-heap over the subset currently available for selection. Selection and
//! the connection-count increment happen in one critical section, so two
//! concurrent selections can never both act on the same stale minimum.
//!
//! Marking an upstream unavailable removes it from the heap but preserves
//! its count; in-flight connections keep draining through
//! `connection_ended` and the count is correct if the upstream later
//! returns.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::proxy::heap::{UpstreamEntry, UpstreamHeap};

/// Connection counts and availability for one upstream group.
///
/// All operations serialize on an internal lock; none perform I/O.
#[derive(Debug, Default)]
pub struct GroupTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Slot-addressed entries, stable for the tracker's lifetime.
    entries: Vec<UpstreamEntry>,
    /// Upstream id to slot.
    slots: HashMap<Uuid, usize>,
    /// Available entries, fewest connections first.
    heap: UpstreamHeap,
}

impl GroupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upstream with a zero count, outside the heap.
    ///
    /// The id must not already be registered.
    pub fn add(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("tracker lock");
        debug_assert!(!inner.slots.contains_key(&id), "upstream registered twice");
        let slot = inner.entries.len();
        inner.entries.push(UpstreamEntry::new(id));
        inner.slots.insert(id, slot);
    }

    /// Make an upstream eligible for selection. No-op if it already is.
    pub fn mark_available(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let Some(&slot) = inner.slots.get(&id) else {
            debug_assert!(false, "mark_available for unregistered upstream");
            return;
        };
        if inner.entries[slot].heap_index.is_some() {
            return;
        }
        let Inner { entries, heap, .. } = &mut *inner;
        heap.push(entries, slot);
    }

    /// Remove an upstream from selection, keeping its count. No-op if it is
    /// already out.
    pub fn mark_unavailable(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let Some(&slot) = inner.slots.get(&id) else {
            debug_assert!(false, "mark_unavailable for unregistered upstream");
            return;
        };
        if inner.entries[slot].heap_index.is_none() {
            return;
        }
        let Inner { entries, heap, .. } = &mut *inner;
        heap.remove(entries, slot);
    }

    /// Pick the available upstream with the fewest connections and record
    /// the new connection against it.
    ///
    /// Every `Ok` must eventually be paired with one `connection_ended`.
    pub fn select_next(&self) -> Result<Uuid, Error> {
        let mut inner = self.inner.lock().expect("tracker lock");
        let Inner { entries, heap, .. } = &mut *inner;
        let slot = heap.peek().ok_or(Error::NoAvailableUpstream)?;
        entries[slot].conn_count += 1;
        heap.fix(entries, slot);
        Ok(entries[slot].id)
    }

    /// Record that a previously selected connection finished.
    pub fn connection_ended(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let Some(&slot) = inner.slots.get(&id) else {
            debug_assert!(false, "connection_ended for unregistered upstream");
            return;
        };
        let Inner { entries, heap, .. } = &mut *inner;
        let entry = &mut entries[slot];
        debug_assert!(entry.conn_count > 0, "connection_ended without selection");
        entry.conn_count = entry.conn_count.saturating_sub(1);
        if entry.heap_index.is_some() {
            heap.fix(entries, slot);
        } else {
            debug!(upstream_id = %id, "Connection ended for unavailable upstream");
        }
    }

    /// Live connection count for an upstream, if registered.
    pub fn conn_count(&self, id: Uuid) -> Option<u32> {
        let inner = self.inner.lock().expect("tracker lock");
        let slot = *inner.slots.get(&id)?;
        Some(inner.entries[slot].conn_count)
    }

    /// Number of upstreams currently eligible for selection.
    pub fn available_count(&self) -> usize {
        self.inner.lock().expect("tracker lock").heap.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn tracker_with(ids: &[Uuid]) -> GroupTracker {
        let tracker = GroupTracker::new();
        for &id in ids {
            tracker.add(id);
        }
        tracker
    }

    #[test]
    fn select_fails_until_marked_available() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let tracker = tracker_with(&[u1, u2]);

        assert!(matches!(
            tracker.select_next(),
            Err(Error::NoAvailableUpstream)
        ));

        tracker.mark_available(u1);
        assert_eq!(tracker.select_next().unwrap(), u1);
        assert_eq!(tracker.conn_count(u1), Some(1));
        assert_eq!(tracker.conn_count(u2), Some(0));
        assert_eq!(tracker.available_count(), 1);
    }

    #[test]
    fn concurrent_selections_balance_across_upstreams() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let tracker = Arc::new(tracker_with(&[u1, u2]));
        tracker.mark_available(u1);
        tracker.mark_available(u2);

        // Two threads each take five connections; strict least-connections
        // keeps the counts level no matter the interleaving.
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        tracker.select_next().expect("upstream available");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.conn_count(u1), Some(5));
        assert_eq!(tracker.conn_count(u2), Some(5));
    }

    #[test]
    fn unavailability_preserves_counts() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let tracker = tracker_with(&[u1, u2]);
        tracker.mark_available(u1);
        tracker.mark_available(u2);

        // One selection each.
        assert_eq!(tracker.select_next().unwrap(), u1);
        assert_eq!(tracker.select_next().unwrap(), u2);

        tracker.mark_unavailable(u1);
        assert_eq!(tracker.select_next().unwrap(), u2);
        assert_eq!(tracker.select_next().unwrap(), u2);

        // u1 returns with its old count of 1 and wins the next selection
        // over u2's 3.
        tracker.mark_available(u1);
        assert_eq!(tracker.select_next().unwrap(), u1);

        assert_eq!(tracker.conn_count(u1), Some(2));
        assert_eq!(tracker.conn_count(u2), Some(3));
        assert_eq!(tracker.available_count(), 2);
    }

    #[test]
    fn connection_ended_updates_selection_order() {
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let tracker = tracker_with(&[u1, u2]);
        tracker.mark_available(u1);
        tracker.mark_available(u2);

        let first = tracker.select_next().unwrap();
        let second = tracker.select_next().unwrap();
        assert_ne!(first, second);

        // Ending u1's connection makes it the strict minimum again.
        tracker.connection_ended(u1);
        assert_eq!(tracker.select_next().unwrap(), u1);
    }

    #[test]
    fn draining_while_unavailable_keeps_counts_correct() {
        let u1 = Uuid::new_v4();
        let tracker = tracker_with(&[u1]);
        tracker.mark_available(u1);

        tracker.select_next().unwrap();
        tracker.select_next().unwrap();
        tracker.mark_unavailable(u1);

        tracker.connection_ended(u1);
        assert_eq!(tracker.conn_count(u1), Some(1));
        // Dropping to zero does not restore availability; only a health
        // transition does.
        tracker.connection_ended(u1);
        assert_eq!(tracker.conn_count(u1), Some(0));
        assert_eq!(tracker.available_count(), 0);
        assert!(matches!(
            tracker.select_next(),
            Err(Error::NoAvailableUpstream)
        ));
    }

    #[test]
    fn mark_available_is_idempotent() {
        let u1 = Uuid::new_v4();
        let tracker = tracker_with(&[u1]);
        tracker.mark_available(u1);
        tracker.mark_available(u1);
        assert_eq!(tracker.available_count(), 1);

        tracker.mark_unavailable(u1);
        tracker.mark_unavailable(u1);
        assert_eq!(tracker.available_count(), 0);
    }
}
