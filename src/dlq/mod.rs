//! Dead-letter storage: messages that exhausted retries, kept for inspection
//! and optional replay, per SPEC_FULL.md §4.6.
//!
//! Ordered by `failure_timestamp` (oldest first) so capacity eviction and
//! listing both have an obvious, cheap answer; grounded on the ordering and
//! eviction shape of `dlq.rs` from the pack's `other_examples/` (a queue-side
//! dead-letter store, not the teacher itself).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::core::{MessageId, QueueError, Result};
use crate::envelope::DeadLetterEnvelope;

struct Entry {
    failure_timestamp: DateTime<Utc>,
    dead_letter: DeadLetterEnvelope,
}

/// Counters and aggregates surfaced to the host for observability.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterMetrics {
    pub total_added: u64,
    pub total_replayed: u64,
    pub total_purged: u64,
    pub current_count: usize,
    pub evicted_on_capacity: u64,
    pub oldest_failure_timestamp: Option<DateTime<Utc>>,
    pub counts_by_message_type: BTreeMap<String, u64>,
    pub counts_by_failure_reason: BTreeMap<String, u64>,
}

pub struct DeadLetterQueue {
    capacity: usize,
    // Keyed by (failure_timestamp, message_id) for a stable oldest-first order
    // even when two failures land in the same millisecond.
    entries: RwLock<BTreeMap<(DateTime<Utc>, MessageId), Entry>>,
    by_id: RwLock<BTreeMap<MessageId, (DateTime<Utc>, MessageId)>>,
    total_added: std::sync::atomic::AtomicU64,
    total_replayed: std::sync::atomic::AtomicU64,
    total_purged: std::sync::atomic::AtomicU64,
    evicted_on_capacity: std::sync::atomic::AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(BTreeMap::new()),
            by_id: RwLock::new(BTreeMap::new()),
            total_added: Default::default(),
            total_replayed: Default::default(),
            total_purged: Default::default(),
            evicted_on_capacity: Default::default(),
        }
    }

    /// Recovery-only: reinserts `dead_letter` entries loaded from a snapshot
    /// without bumping `total_added` or re-evaluating capacity eviction.
    pub fn restore(&self, dead_letters: Vec<DeadLetterEnvelope>) {
        let mut entries = self.entries.write();
        let mut by_id = self.by_id.write();
        entries.clear();
        by_id.clear();
        for dl in dead_letters {
            let key = (dl.failure_timestamp, dl.envelope.message_id);
            by_id.insert(dl.envelope.message_id, key);
            entries.insert(
                key,
                Entry {
                    failure_timestamp: dl.failure_timestamp,
                    dead_letter: dl,
                },
            );
        }
    }

    /// Adds `dead_letter`, evicting the oldest entry first if at capacity.
    pub fn add(&self, dead_letter: DeadLetterEnvelope) {
        let key = (dead_letter.failure_timestamp, dead_letter.envelope.message_id);

        let mut entries = self.entries.write();
        let mut by_id = self.by_id.write();

        if entries.len() >= self.capacity {
            if let Some((&oldest_key, _)) = entries.iter().next() {
                entries.remove(&oldest_key);
                by_id.remove(&oldest_key.1);
                self.evicted_on_capacity
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }

        by_id.insert(dead_letter.envelope.message_id, key);
        entries.insert(
            key,
            Entry {
                failure_timestamp: dead_letter.failure_timestamp,
                dead_letter,
            },
        );
        self.total_added
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self, message_id: MessageId) -> Option<DeadLetterEnvelope> {
        let by_id = self.by_id.read();
        let key = by_id.get(&message_id)?;
        self.entries.read().get(key).map(|e| e.dead_letter.clone())
    }

    /// Removes and returns the dead-lettered envelope. When `reset_retry_count`
    /// is set, the replay carries a fresh `message_id` and `retry_count = 0` —
    /// a clean attempt budget rather than one already at the edge of
    /// exhaustion; otherwise the envelope is handed back unchanged so the
    /// caller can decide what to do with its existing retry history.
    pub fn replay(&self, message_id: MessageId, reset_retry_count: bool) -> Result<DeadLetterEnvelope> {
        let mut entries = self.entries.write();
        let mut by_id = self.by_id.write();
        let key = by_id
            .remove(&message_id)
            .ok_or(QueueError::NotFound(message_id))?;
        let entry = entries
            .remove(&key)
            .ok_or(QueueError::NotFound(message_id))?;
        self.total_replayed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut dead_letter = entry.dead_letter;
        if reset_retry_count {
            dead_letter.envelope.message_id = MessageId::new();
            dead_letter.envelope.retry_count = 0;
        }
        dead_letter.envelope.is_superseded = false;
        Ok(dead_letter)
    }

    /// Permanently discards entries whose `failure_timestamp` is older than
    /// `now - older_than`. `None` (or a zero duration) purges everything.
    /// Returns the purged message ids, in oldest-first order, so the caller
    /// can journal one `DeadLetterPurge` record per removed entry.
    pub fn purge(&self, older_than: Option<Duration>) -> Vec<MessageId> {
        let cutoff = match older_than {
            Some(d) if d > Duration::ZERO => {
                chrono::Duration::from_std(d).ok().map(|d| Utc::now() - d)
            }
            _ => None,
        };

        let mut entries = self.entries.write();
        let mut by_id = self.by_id.write();

        let stale_keys: Vec<(DateTime<Utc>, MessageId)> = entries
            .keys()
            .filter(|(failure_timestamp, _)| {
                cutoff.is_none_or(|cutoff| *failure_timestamp < cutoff)
            })
            .copied()
            .collect();

        let mut purged = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            entries.remove(&key);
            by_id.remove(&key.1);
            purged.push(key.1);
        }
        self.total_purged
            .fetch_add(purged.len() as u64, std::sync::atomic::Ordering::Relaxed);
        purged
    }

    /// Bounded view over the stored entries, oldest-first, optionally
    /// restricted to one message type and/or capped to `limit` entries.
    pub fn list(&self, message_type: Option<&str>, limit: Option<usize>) -> Vec<DeadLetterEnvelope> {
        let iter = self
            .entries
            .read()
            .values()
            .filter(|e| {
                message_type.is_none_or(|t| e.dead_letter.envelope.message_type == t)
            })
            .map(|e| e.dead_letter.clone())
            .collect::<Vec<_>>();
        match limit {
            Some(n) => iter.into_iter().take(n).collect(),
            None => iter,
        }
    }

    pub fn snapshot(&self) -> Vec<DeadLetterEnvelope> {
        self.list(None, None)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> DeadLetterMetrics {
        use std::sync::atomic::Ordering::Relaxed;
        let entries = self.entries.read();

        let mut counts_by_message_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut counts_by_failure_reason: BTreeMap<String, u64> = BTreeMap::new();
        for entry in entries.values() {
            *counts_by_message_type
                .entry(entry.dead_letter.envelope.message_type.clone())
                .or_default() += 1;
            *counts_by_failure_reason
                .entry(entry.dead_letter.failure_reason.clone())
                .or_default() += 1;
        }
        let oldest_failure_timestamp = entries.keys().next().map(|(ts, _)| *ts);

        DeadLetterMetrics {
            total_added: self.total_added.load(Relaxed),
            total_replayed: self.total_replayed.load(Relaxed),
            total_purged: self.total_purged.load(Relaxed),
            current_count: entries.len(),
            evicted_on_capacity: self.evicted_on_capacity.load(Relaxed),
            oldest_failure_timestamp,
            counts_by_message_type,
            counts_by_failure_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageEnvelope;

    fn dead_letter(message_type: &str, offset_secs: i64) -> DeadLetterEnvelope {
        let envelope = MessageEnvelope::new(message_type, b"x".to_vec(), 3);
        DeadLetterEnvelope {
            envelope,
            failure_reason: "retries exhausted".into(),
            exception_type: None,
            exception_message: None,
            exception_stack: None,
            failure_timestamp: Utc::now() + chrono::Duration::seconds(offset_secs),
            last_handler_id: Some("h1".into()),
        }
    }

    #[test]
    fn replay_with_reset_assigns_fresh_id_and_zero_retry_count() {
        let dlq = DeadLetterQueue::new(10);
        let mut dl = dead_letter("T", 0);
        dl.envelope.retry_count = 5;
        let id = dl.envelope.message_id;
        dlq.add(dl);

        let replayed = dlq.replay(id, true).unwrap();
        assert_ne!(replayed.envelope.message_id, id);
        assert_eq!(replayed.envelope.retry_count, 0);
        assert!(dlq.get(id).is_none());
    }

    #[test]
    fn replay_without_reset_keeps_id_and_retry_count() {
        let dlq = DeadLetterQueue::new(10);
        let mut dl = dead_letter("T", 0);
        dl.envelope.retry_count = 5;
        let id = dl.envelope.message_id;
        dlq.add(dl);

        let replayed = dlq.replay(id, false).unwrap();
        assert_eq!(replayed.envelope.message_id, id);
        assert_eq!(replayed.envelope.retry_count, 5);
    }

    #[test]
    fn purge_all_when_older_than_is_none() {
        let dlq = DeadLetterQueue::new(10);
        dlq.add(dead_letter("T", 0));
        dlq.add(dead_letter("U", 1));
        let purged = dlq.purge(None);
        assert_eq!(purged.len(), 2);
        assert!(dlq.is_empty());
        assert_eq!(dlq.metrics().total_purged, 2);
    }

    #[test]
    fn purge_respects_age_threshold() {
        let dlq = DeadLetterQueue::new(10);
        let old = dead_letter("T", -3600);
        let old_id = old.envelope.message_id;
        let recent = dead_letter("T", 0);
        let recent_id = recent.envelope.message_id;
        dlq.add(old);
        dlq.add(recent);

        let purged = dlq.purge(Some(Duration::from_secs(60)));
        assert_eq!(purged, vec![old_id]);
        assert!(dlq.get(old_id).is_none());
        assert!(dlq.get(recent_id).is_some());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let dlq = DeadLetterQueue::new(2);
        let first = dead_letter("T", 0);
        let first_id = first.envelope.message_id;
        let second = dead_letter("T", 1);
        let third = dead_letter("T", 2);

        dlq.add(first);
        dlq.add(second);
        dlq.add(third);

        assert_eq!(dlq.len(), 2);
        assert!(dlq.get(first_id).is_none());
        assert_eq!(dlq.metrics().evicted_on_capacity, 1);
    }

    #[test]
    fn list_filters_by_message_type_and_limit() {
        let dlq = DeadLetterQueue::new(10);
        dlq.add(dead_letter("T", 0));
        dlq.add(dead_letter("U", 1));
        dlq.add(dead_letter("T", 2));

        assert_eq!(dlq.list(Some("T"), None).len(), 2);
        assert_eq!(dlq.list(None, Some(1)).len(), 1);
    }

    #[test]
    fn metrics_report_oldest_timestamp_and_breakdowns() {
        let dlq = DeadLetterQueue::new(10);
        dlq.add(dead_letter("T", -10));
        dlq.add(dead_letter("U", 0));

        let metrics = dlq.metrics();
        assert!(metrics.oldest_failure_timestamp.is_some());
        assert_eq!(metrics.counts_by_message_type.get("T"), Some(&1));
        assert_eq!(metrics.counts_by_message_type.get("U"), Some(&1));
        assert_eq!(
            metrics.counts_by_failure_reason.get("retries exhausted"),
            Some(&2)
        );
    }

    #[test]
    fn missing_id_returns_not_found() {
        let dlq = DeadLetterQueue::new(10);
        assert!(matches!(
            dlq.replay(MessageId::new(), true),
            Err(QueueError::NotFound(_))
        ));
    }
}
