//! [`QueueManager`]: the orchestrator that ties the buffer, dedup index,
//! persister, and dead-letter queue together behind enqueue/checkout/
//! acknowledge/requeue, per SPEC_FULL.md §4.3.
//!
//! Grounded on the teacher's top-level `InMemoryDb`-style facade that
//! sequenced command application, journaling, and snapshot triggering behind
//! one lock-free entry point (`persist/runtime/mod.rs`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::buffer::{CircularBuffer, ReplaceOutcome};
use crate::config::{compute_backoff, BackoffStrategy, PersistenceOptions, QueueOptions};
use crate::core::{MessageId, QueueError, Result};
use crate::dedup::DeduplicationIndex;
use crate::dlq::DeadLetterQueue;
use crate::envelope::{
    DeadLetterEnvelope, MessageEnvelope, MessageMetadata, OpCode, OperationRecord, QueueSnapshot,
};
use crate::persist::Persister;
use crate::recovery::RecoveryService;

/// Caller-supplied data for a new publish; `max_retries` and backoff knobs
/// are the handler's (looked up by the dispatcher from its per-type
/// [`crate::config::HandlerOptions`]), not the queue's own defaults, since
/// each message type may be configured differently.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub deduplication_key: Option<String>,
    pub not_before: Option<chrono::DateTime<Utc>>,
    pub metadata: MessageMetadata,
}

/// Outcome of a failed checkout: either the message goes back to `Ready` with
/// a backoff delay, or it has exhausted its retry budget and moves to the DLQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued(MessageEnvelope),
    DeadLettered(DeadLetterEnvelope),
}

pub struct QueueManager {
    buffer: CircularBuffer,
    dedup: DeduplicationIndex,
    dlq: DeadLetterQueue,
    persister: Option<Persister>,
    sequence: AtomicU64,
    options: QueueOptions,
}

impl QueueManager {
    /// Builds a fresh, empty queue (no recovery). Used when
    /// `persistence_enabled` is false or by tests.
    pub fn new(options: QueueOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            buffer: CircularBuffer::new(options.capacity),
            dedup: DeduplicationIndex::new(),
            dlq: DeadLetterQueue::new(options.dead_letter_capacity),
            persister: None,
            sequence: AtomicU64::new(0),
            options,
        })
    }

    /// Opens the persister, replays prior state through [`RecoveryService`],
    /// and rehydrates the buffer/dedup/DLQ from it.
    pub async fn open(options: QueueOptions, persistence: PersistenceOptions) -> Result<Self> {
        options.validate()?;
        persistence.validate()?;

        let recovered = RecoveryService::recover(
            &persistence,
            chrono::Duration::from_std(options.default_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        )
        .await?;

        let buffer = CircularBuffer::new(options.capacity);
        for env in recovered.messages {
            buffer.restore(env)?;
        }

        let dedup = DeduplicationIndex::new();
        dedup.restore(recovered.deduplication_index);

        let dlq = DeadLetterQueue::new(options.dead_letter_capacity);
        dlq.restore(recovered.dead_letter_messages);

        let persister = Persister::open(persistence).await?;

        Ok(Self {
            buffer,
            dedup,
            dlq,
            persister: Some(persister),
            sequence: AtomicU64::new(recovered.next_sequence_number),
            options,
        })
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn journal(&self, op_code: OpCode, message_id: MessageId, envelope: Option<MessageEnvelope>, dead_letter: Option<DeadLetterEnvelope>) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let record = OperationRecord {
            sequence_number: self.next_sequence(),
            op_code,
            message_id,
            timestamp: Utc::now(),
            envelope,
            dead_letter,
        };
        persister.append(&record).await?;
        if persister.should_snapshot() {
            let snapshot = self.snapshot();
            persister.write_snapshot(&snapshot).await?;
        }
        Ok(())
    }

    /// Publishes a new message, applying dedup-replace semantics when
    /// `request.deduplication_key` is set and `deduplication_enabled`.
    pub async fn enqueue(
        &self,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        max_retries: u32,
        request: PublishRequest,
    ) -> Result<MessageId> {
        let message_type = message_type.into();
        let mut envelope = MessageEnvelope::new(message_type, payload, max_retries);
        envelope.deduplication_key = request.deduplication_key.clone();
        envelope.not_before = request.not_before;
        envelope.metadata = request.metadata;
        let message_id = envelope.message_id;

        if self.options.deduplication_enabled {
            if let Some(key) = &request.deduplication_key {
                let outcome = self.buffer.replace(envelope.clone(), key)?;
                match outcome {
                    ReplaceOutcome::ReplacedInPlace | ReplaceOutcome::SupersededAndInserted => {
                        self.dedup.insert(key.clone(), message_id);
                        self.journal(OpCode::Replace, message_id, Some(envelope), None)
                            .await?;
                        return Ok(message_id);
                    }
                    ReplaceOutcome::NotFound => {
                        // Fall through: no live holder of this key, plain enqueue.
                    }
                }
            }
        }

        self.buffer.enqueue(envelope.clone())?;
        if let Some(key) = &request.deduplication_key {
            if self.options.deduplication_enabled {
                self.dedup.insert(key.clone(), message_id);
            }
        }
        self.journal(OpCode::Enqueue, message_id, Some(envelope), None)
            .await?;
        Ok(message_id)
    }

    /// Claims the earliest-eligible `Ready` message of `message_type`.
    pub async fn checkout(
        &self,
        message_type: &str,
        handler_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<MessageEnvelope>> {
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|e| QueueError::ConfigurationInvalid(e.to_string()))?;
        let Some(envelope) = self.buffer.checkout(message_type, handler_id, lease) else {
            return Ok(None);
        };
        self.journal(OpCode::Checkout, envelope.message_id, None, None)
            .await?;
        Ok(Some(envelope))
    }

    /// Confirms successful processing, freeing the slot and the dedup key.
    pub async fn acknowledge(&self, message_id: MessageId) -> Result<()> {
        let envelope = self
            .buffer
            .get(message_id)
            .ok_or(QueueError::NotFound(message_id))?;
        if !self.buffer.acknowledge(message_id) {
            return Err(QueueError::InvalidState(
                "message is not currently in flight".into(),
            ));
        }
        if let Some(key) = &envelope.deduplication_key {
            self.dedup.remove_if_current(key, message_id);
        }
        self.journal(OpCode::Acknowledge, message_id, None, None)
            .await
    }

    /// Handler-reported or lease-timeout failure: bumps retry_count and
    /// either schedules the next attempt (with backoff) or routes to the DLQ
    /// once `max_retries` (fixed on the envelope at enqueue time) is exceeded.
    pub async fn requeue(
        &self,
        message_id: MessageId,
        backoff_strategy: BackoffStrategy,
        initial_backoff: Duration,
        max_backoff: Duration,
        failure_reason: impl Into<String>,
        exception_type: Option<String>,
        exception_message: Option<String>,
    ) -> Result<RequeueOutcome> {
        let current = self
            .buffer
            .get(message_id)
            .ok_or(QueueError::NotFound(message_id))?;
        let next_retry_count = current.retry_count + 1;

        if next_retry_count > current.max_retries {
            let removed = self
                .buffer
                .remove(message_id)
                .ok_or(QueueError::NotFound(message_id))?;
            if let Some(key) = &removed.deduplication_key {
                self.dedup.remove_if_current(key, message_id);
            }
            let last_handler_id = removed.lease.as_ref().map(|l| l.handler_id.clone());
            let mut dead_envelope = removed;
            dead_envelope.retry_count = next_retry_count;
            dead_envelope.lease = None;
            let dead_letter = DeadLetterEnvelope {
                envelope: dead_envelope,
                failure_reason: failure_reason.into(),
                exception_type,
                exception_message,
                exception_stack: None,
                failure_timestamp: Utc::now(),
                last_handler_id,
            };
            self.dlq.add(dead_letter.clone());
            self.journal(OpCode::DeadLetter, message_id, None, Some(dead_letter.clone()))
                .await?;
            return Ok(RequeueOutcome::DeadLettered(dead_letter));
        }

        let not_before = compute_backoff(backoff_strategy, next_retry_count, initial_backoff, max_backoff)
            .map(|delay| Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());

        let updated = self
            .buffer
            .requeue(message_id, |env| {
                env.retry_count = next_retry_count;
                env.not_before = not_before;
            })
            .ok_or(QueueError::NotFound(message_id))?;
        self.journal(OpCode::Requeue, message_id, Some(updated.clone()), None)
            .await?;
        Ok(RequeueOutcome::Requeued(updated))
    }

    /// Extends an in-flight lease, used for long-running handlers that send
    /// periodic heartbeats.
    pub async fn extend_lease(&self, message_id: MessageId, new_duration: Duration) -> Result<()> {
        let new_expiry = Utc::now()
            + chrono::Duration::from_std(new_duration)
                .map_err(|e| QueueError::ConfigurationInvalid(e.to_string()))?;
        if !self.buffer.extend_lease(message_id, new_expiry) {
            return Err(QueueError::NotFound(message_id));
        }
        let envelope = self.buffer.get(message_id);
        self.journal(OpCode::LeaseRenew, message_id, envelope, None)
            .await
    }

    /// Replays a dead-lettered message back into the live buffer. When
    /// `reset_retry_count` is set the replayed envelope gets a fresh
    /// `message_id` and `retry_count = 0`; otherwise it re-enters the queue
    /// with its prior id and retry history intact.
    pub async fn dead_letter_replay(
        &self,
        message_id: MessageId,
        reset_retry_count: bool,
    ) -> Result<MessageId> {
        let dead_letter = self.dlq.replay(message_id, reset_retry_count)?;
        let mut envelope = dead_letter.envelope;
        envelope.status = crate::envelope::MessageStatus::Ready;
        self.buffer.restore(envelope.clone())?;
        if let Some(key) = &envelope.deduplication_key {
            self.dedup.insert(key.clone(), envelope.message_id);
        }
        self.journal(OpCode::DeadLetterReplay, envelope.message_id, Some(envelope.clone()), None)
            .await?;
        Ok(envelope.message_id)
    }

    /// Purges dead letters older than `older_than` (everything, if `None`),
    /// journaling one `DeadLetterPurge` record per removed entry. Returns the
    /// purged ids.
    pub async fn dead_letter_purge(&self, older_than: Option<Duration>) -> Result<Vec<MessageId>> {
        let purged = self.dlq.purge(older_than);
        for message_id in &purged {
            self.journal(OpCode::DeadLetterPurge, *message_id, None, None)
                .await?;
        }
        Ok(purged)
    }

    /// Bounded, optionally type-filtered view over the dead-letter queue.
    pub fn dead_letters(
        &self,
        message_type: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<DeadLetterEnvelope> {
        self.dlq.list(message_type, limit)
    }

    pub fn dead_letter_metrics(&self) -> crate::dlq::DeadLetterMetrics {
        self.dlq.metrics()
    }

    pub fn get(&self, message_id: MessageId) -> Option<MessageEnvelope> {
        self.buffer.get(message_id)
    }

    pub fn pending_messages(&self) -> Vec<MessageEnvelope> {
        self.buffer.get_all()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Ready/in-flight/superseded-in-flight breakdown, per SPEC_FULL.md §9's
    /// resolution to keep superseded messages out of the `in_flight` bucket.
    pub fn buffer_counts(&self) -> crate::buffer::BufferCounts {
        self.buffer.counts()
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            version: self.sequence.load(Ordering::Relaxed),
            created_at: Utc::now(),
            capacity: self.options.capacity,
            messages: self.buffer.get_all(),
            deduplication_index: self.dedup.snapshot(),
            dead_letter_messages: self.dlq.snapshot(),
        }
    }

    /// Forces an immediate snapshot regardless of `snapshot_threshold`; used
    /// by a host's graceful-shutdown path.
    pub async fn force_snapshot(&self) -> Result<()> {
        let Some(persister) = &self.persister else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        persister.write_snapshot(&snapshot).await
    }
}
