//! In-memory progress table shared between the transport event loop and
//! the heartbeat flusher.
//!
//! The table keeps the latest cumulative byte count per live transfer and
//! a dirty set of transfers that changed since the last drain. Draining is
//! destructive for the dirty set only; the latest counts stay until the
//! transfer is removed.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Latest observed progress for one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Default)]
struct Inner {
    latest: HashMap<Uuid, ProgressSnapshot>,
    dirty: HashSet<Uuid>,
}

/// Shared progress aggregator. Writers overwrite, readers drain.
#[derive(Default)]
pub struct ProgressTable {
    inner: Mutex<Inner>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest cumulative byte count for a transfer and mark it
    /// dirty. A missing total keeps the previously reported one.
    pub fn record(&self, tag: Uuid, bytes_written: u64, total_bytes: Option<u64>) {
        let mut inner = self.inner.lock();
        let entry = inner.latest.entry(tag).or_default();
        entry.bytes_written = bytes_written;
        entry.total_bytes = total_bytes.or(entry.total_bytes);
        inner.dirty.insert(tag);
    }

    /// Register a transfer as live without marking it dirty. Keeps the
    /// table non-empty while a task has not produced bytes yet.
    pub fn mark_active(&self, tag: Uuid) {
        let mut inner = self.inner.lock();
        inner.latest.entry(tag).or_default();
    }

    /// Drop a transfer from the table entirely.
    pub fn remove(&self, tag: &Uuid) {
        let mut inner = self.inner.lock();
        inner.latest.remove(tag);
        inner.dirty.remove(tag);
    }

    /// Take the dirty snapshot set. Transfers that have not written any
    /// bytes are skipped so a fresh task never persists a zero row.
    pub fn drain_dirty(&self) -> Vec<(Uuid, ProgressSnapshot)> {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty);
        dirty
            .into_iter()
            .filter_map(|tag| {
                let snapshot = inner.latest.get(&tag).copied()?;
                (snapshot.bytes_written > 0).then_some((tag, snapshot))
            })
            .collect()
    }

    pub fn get(&self, tag: &Uuid) -> Option<ProgressSnapshot> {
        self.inner.lock().latest.get(tag).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let table = ProgressTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        table.record(a, 100, Some(1000));
        table.record(a, 250, None);
        table.record(b, 50, None);

        let mut drained = table.drain_dirty();
        drained.sort_by_key(|(tag, _)| *tag);
        let mut expected = vec![
            (
                a,
                ProgressSnapshot {
                    bytes_written: 250,
                    total_bytes: Some(1000),
                },
            ),
            (
                b,
                ProgressSnapshot {
                    bytes_written: 50,
                    total_bytes: None,
                },
            ),
        ];
        expected.sort_by_key(|(tag, _)| *tag);
        assert_eq!(drained, expected);

        // Drained entries stay in the table but are no longer dirty
        assert_eq!(table.len(), 2);
        assert!(table.drain_dirty().is_empty());
    }

    #[test]
    fn test_zero_byte_entries_are_not_drained() {
        let table = ProgressTable::new();
        let tag = Uuid::new_v4();

        table.record(tag, 0, None);
        assert!(table.drain_dirty().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mark_active_is_not_dirty() {
        let table = ProgressTable::new();
        let tag = Uuid::new_v4();

        table.mark_active(tag);
        assert_eq!(table.len(), 1);
        assert!(table.drain_dirty().is_empty());

        // Registering an already-tracked transfer keeps its progress
        table.record(tag, 300, None);
        table.mark_active(tag);
        assert_eq!(
            table.get(&tag),
            Some(ProgressSnapshot {
                bytes_written: 300,
                total_bytes: None,
            })
        );
    }

    #[test]
    fn test_remove_clears_dirty_state() {
        let table = ProgressTable::new();
        let tag = Uuid::new_v4();

        table.record(tag, 512, None);
        table.remove(&tag);

        assert!(table.is_empty());
        assert!(table.drain_dirty().is_empty());
    }

    #[test]
    fn test_drain_keeps_latest_for_next_round() {
        let table = ProgressTable::new();
        let tag = Uuid::new_v4();

        table.record(tag, 100, None);
        assert_eq!(table.drain_dirty().len(), 1);

        table.record(tag, 200, None);
        let drained = table.drain_dirty();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.bytes_written, 200);
    }
}
