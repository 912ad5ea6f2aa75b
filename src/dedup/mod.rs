//! Keyed deduplication index mapping `deduplication_key -> MessageId` for the
//! currently non-terminal envelope holding that key, per SPEC_FULL.md §4.2.
//!
//! Backed by `dashmap` rather than a `Mutex<HashMap<_>>` so that lookups
//! during enqueue don't serialize against each other on the hot path; the
//! buffer's slot-level CAS is still what actually arbitrates concurrent
//! replaces of the same key.

use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::core::MessageId;

pub struct DeduplicationIndex {
    entries: DashMap<String, MessageId>,
}

impl DeduplicationIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<MessageId> {
        self.entries.get(key).map(|r| *r.value())
    }

    /// Records that `id` now owns `key`, returning whatever `id` it displaced
    /// (the prior holder, now superseded or acknowledged).
    pub fn insert(&self, key: impl Into<String>, id: MessageId) -> Option<MessageId> {
        self.entries.insert(key.into(), id)
    }

    /// Removes the mapping only if it still points at `id`; a no-op (and
    /// returns `false`) if the key was already replaced by a newer message.
    pub fn remove_if_current(&self, key: &str, id: MessageId) -> bool {
        match self.entries.get(key) {
            Some(current) if *current.value() == id => {
                drop(current);
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &str) -> Option<MessageId> {
        self.entries.remove(key).map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MessageId> {
        self.entries
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect()
    }

    /// Recovery-only: replaces the whole index, e.g. after loading a snapshot.
    pub fn restore(&self, entries: BTreeMap<String, MessageId>) {
        self.entries.clear();
        for (key, id) in entries {
            self.entries.insert(key, id);
        }
    }
}

impl Default for DeduplicationIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_returns_displaced_id() {
        let idx = DeduplicationIndex::new();
        let a = MessageId::new();
        let b = MessageId::new();
        assert_eq!(idx.insert("k", a), None);
        assert_eq!(idx.insert("k", b), Some(a));
        assert_eq!(idx.get("k"), Some(b));
    }

    #[test]
    fn remove_if_current_ignores_stale_id() {
        let idx = DeduplicationIndex::new();
        let a = MessageId::new();
        let b = MessageId::new();
        idx.insert("k", a);
        idx.insert("k", b);
        assert!(!idx.remove_if_current("k", a));
        assert_eq!(idx.get("k"), Some(b));
        assert!(idx.remove_if_current("k", b));
        assert_eq!(idx.get("k"), None);
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let idx = DeduplicationIndex::new();
        idx.insert("a", MessageId::new());
        idx.insert("b", MessageId::new());
        let snap = idx.snapshot();

        let restored = DeduplicationIndex::new();
        restored.restore(snap.clone());
        assert_eq!(restored.snapshot(), snap);
    }
}
