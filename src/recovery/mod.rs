//! Snapshot load + journal replay + lease-expiry scan, run once at startup
//! before the queue begins serving requests, per SPEC_FULL.md §4.5.
//!
//! Grounded on the teacher's recovery pass in `persist/runtime/mod.rs`
//! (`load_snapshot` then `replay_journal_since`), generalized to the queue's
//! op codes and to the supersede/dedup invariants this engine adds.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::config::PersistenceOptions;
use crate::core::{MessageId, Result};
use crate::envelope::{DeadLetterEnvelope, MessageEnvelope, MessageStatus, OpCode, OperationRecord};
use crate::persist::{journal, snapshot};

/// Everything a [`crate::queue::QueueManager`] needs to rehydrate its
/// in-memory state: the buffer and dedup index are populated from this, not
/// from the snapshot/journal directly.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub messages: Vec<MessageEnvelope>,
    pub deduplication_index: BTreeMap<String, MessageId>,
    pub dead_letter_messages: Vec<DeadLetterEnvelope>,
    pub next_sequence_number: u64,
    pub snapshot_version: u64,
}

pub struct RecoveryService;

impl RecoveryService {
    /// Loads the latest snapshot (if any), replays the journal on top of it,
    /// then flips any message whose lease already expired back to `Ready` —
    /// a crash means no worker is actually holding that lease anymore, so
    /// recovery redelivers promptly rather than waiting out the stale lease.
    pub async fn recover(
        options: &PersistenceOptions,
        default_lease_duration: chrono::Duration,
    ) -> Result<RecoveredState> {
        let loaded = match snapshot::read(&options.snapshot_path(), options.crc_validation_enabled)
            .await
        {
            Ok(snap) => snap,
            Err(err) if options.start_empty_on_corrupt_snapshot => {
                tracing::warn!(error = %err, "snapshot failed validation, starting empty and replaying full journal");
                None
            }
            Err(err) => return Err(err),
        };

        let mut messages: BTreeMap<MessageId, MessageEnvelope> = BTreeMap::new();
        let mut dedup: BTreeMap<String, MessageId> = BTreeMap::new();
        let mut dead_letters: Vec<DeadLetterEnvelope> = Vec::new();
        let mut snapshot_version = 0;

        if let Some(snap) = loaded {
            snapshot_version = snap.version;
            for env in snap.messages {
                messages.insert(env.message_id, env);
            }
            dedup = snap.deduplication_index;
            dead_letters = snap.dead_letter_messages;
        }

        let records =
            journal::read_all(&options.journal_path(), options.serialization_format).await?;

        let mut next_sequence_number = 0;
        for record in records {
            next_sequence_number = next_sequence_number.max(record.sequence_number + 1);
            apply_record(
                &mut messages,
                &mut dedup,
                &mut dead_letters,
                record,
                default_lease_duration,
            );
        }

        let now = Utc::now();
        let expired_ids: Vec<MessageId> = messages
            .values()
            .filter(|env| {
                env.status == MessageStatus::InFlight
                    && env.lease.as_ref().is_some_and(|lease| lease.lease_expiry <= now)
            })
            .map(|env| env.message_id)
            .collect();

        for id in expired_ids {
            let mut env = messages.remove(&id).expect("collected from messages above");
            let next_retry_count = env.retry_count + 1;
            if next_retry_count > env.max_retries {
                if let Some(key) = &env.deduplication_key {
                    if dedup.get(key) == Some(&id) {
                        dedup.remove(key);
                    }
                }
                env.retry_count = next_retry_count;
                env.status = MessageStatus::DeadLetter;
                env.lease = None;
                dead_letters.push(DeadLetterEnvelope {
                    envelope: env,
                    failure_reason: "lease expired while no recovery state could confirm handler completion".into(),
                    exception_type: None,
                    exception_message: None,
                    exception_stack: None,
                    failure_timestamp: now,
                    last_handler_id: None,
                });
            } else {
                env.retry_count = next_retry_count;
                env.status = MessageStatus::Ready;
                env.lease = None;
                messages.insert(id, env);
            }
        }

        Ok(RecoveredState {
            messages: messages.into_values().collect(),
            deduplication_index: dedup,
            dead_letter_messages: dead_letters,
            next_sequence_number,
            snapshot_version,
        })
    }
}

fn apply_record(
    messages: &mut BTreeMap<MessageId, MessageEnvelope>,
    dedup: &mut BTreeMap<String, MessageId>,
    dead_letters: &mut Vec<DeadLetterEnvelope>,
    record: OperationRecord,
    default_lease_duration: chrono::Duration,
) {
    match record.op_code {
        OpCode::Enqueue | OpCode::Requeue | OpCode::LeaseRenew | OpCode::DeadLetterReplay => {
            if let Some(env) = record.envelope {
                if let Some(key) = &env.deduplication_key {
                    dedup.insert(key.clone(), env.message_id);
                }
                messages.insert(env.message_id, env);
            }
        }
        OpCode::Replace => {
            if let Some(new_env) = record.envelope {
                if let Some(key) = new_env.deduplication_key.clone() {
                    // At most one non-terminal envelope per key: anything else
                    // currently holding this key is either dropped (it was
                    // Ready and got overwritten in place) or flagged
                    // superseded (it was InFlight and a worker still holds it).
                    let stale_ids: Vec<MessageId> = messages
                        .values()
                        .filter(|e| {
                            e.deduplication_key.as_deref() == Some(key.as_str())
                                && e.message_id != new_env.message_id
                        })
                        .map(|e| e.message_id)
                        .collect();
                    for id in stale_ids {
                        if let Some(existing) = messages.get_mut(&id) {
                            if existing.status == MessageStatus::InFlight {
                                existing.is_superseded = true;
                            } else {
                                messages.remove(&id);
                            }
                        }
                    }
                    dedup.insert(key, new_env.message_id);
                }
                messages.insert(new_env.message_id, new_env);
            }
        }
        OpCode::Checkout => {
            if let Some(env) = messages.get_mut(&record.message_id) {
                env.status = MessageStatus::InFlight;
                env.lease = Some(crate::envelope::Lease {
                    handler_id: "recovered".to_string(),
                    checkout_time: record.timestamp,
                    lease_expiry: record.timestamp + default_lease_duration,
                    extension_count: 0,
                });
            }
        }
        OpCode::Acknowledge => {
            if let Some(env) = messages.remove(&record.message_id) {
                if let Some(key) = env.deduplication_key {
                    if dedup.get(&key) == Some(&record.message_id) {
                        dedup.remove(&key);
                    }
                }
            }
        }
        OpCode::DeadLetter => {
            if let Some(env) = messages.remove(&record.message_id) {
                if let Some(key) = &env.deduplication_key {
                    if dedup.get(key) == Some(&record.message_id) {
                        dedup.remove(key);
                    }
                }
            }
            if let Some(dl) = record.dead_letter {
                dead_letters.push(dl);
            }
        }
        OpCode::DeadLetterPurge => {
            dead_letters.retain(|dl| dl.envelope.message_id != record.message_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceOptions;
    use crate::persist::Persister;
    use tempfile::tempdir;

    #[tokio::test]
    async fn recovers_empty_state_with_no_prior_files() {
        let dir = tempdir().unwrap();
        let options = PersistenceOptions {
            storage_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let recovered = RecoveryService::recover(&options, chrono::Duration::seconds(60)).await.unwrap();
        assert!(recovered.messages.is_empty());
        assert_eq!(recovered.next_sequence_number, 0);
    }

    #[tokio::test]
    async fn replays_enqueue_and_acknowledge() {
        let dir = tempdir().unwrap();
        let options = PersistenceOptions {
            storage_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let persister = Persister::open(options.clone()).await.unwrap();

        let env = MessageEnvelope::new("T", b"x".to_vec(), 3);
        let id = env.message_id;
        persister
            .append(&OperationRecord {
                sequence_number: 0,
                op_code: OpCode::Enqueue,
                message_id: id,
                timestamp: Utc::now(),
                envelope: Some(env),
                dead_letter: None,
            })
            .await
            .unwrap();

        let recovered = RecoveryService::recover(&options, chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(recovered.messages.len(), 1);
        assert_eq!(recovered.next_sequence_number, 1);

        persister
            .append(&OperationRecord {
                sequence_number: 1,
                op_code: OpCode::Acknowledge,
                message_id: id,
                timestamp: Utc::now(),
                envelope: None,
                dead_letter: None,
            })
            .await
            .unwrap();

        let recovered = RecoveryService::recover(&options, chrono::Duration::seconds(60)).await.unwrap();
        assert!(recovered.messages.is_empty());
        assert_eq!(recovered.next_sequence_number, 2);
    }

    #[tokio::test]
    async fn expired_lease_on_checkout_record_is_redelivered() {
        let dir = tempdir().unwrap();
        let options = PersistenceOptions {
            storage_path: dir.path().to_path_buf(),
            snapshot_interval: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let persister = Persister::open(options.clone()).await.unwrap();

        let env = MessageEnvelope::new("T", b"x".to_vec(), 3);
        let id = env.message_id;
        persister
            .append(&OperationRecord {
                sequence_number: 0,
                op_code: OpCode::Enqueue,
                message_id: id,
                timestamp: Utc::now(),
                envelope: Some(env),
                dead_letter: None,
            })
            .await
            .unwrap();
        persister
            .append(&OperationRecord {
                sequence_number: 1,
                op_code: OpCode::Checkout,
                message_id: id,
                // Well older than the 60s approximate lease passed to `recover`
                // below, so the post-replay expiry scan finds it expired.
                timestamp: Utc::now() - chrono::Duration::seconds(120),
                envelope: None,
                dead_letter: None,
            })
            .await
            .unwrap();

        let recovered = RecoveryService::recover(&options, chrono::Duration::seconds(60)).await.unwrap();
        let env = recovered.messages.into_iter().next().unwrap();
        assert_eq!(env.status, MessageStatus::Ready);
        assert!(env.lease.is_none());
        assert_eq!(env.retry_count, 1);
    }

    #[tokio::test]
    async fn expired_lease_beyond_retry_budget_is_dead_lettered_on_recovery() {
        let dir = tempdir().unwrap();
        let options = PersistenceOptions {
            storage_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let persister = Persister::open(options.clone()).await.unwrap();

        let mut env = MessageEnvelope::new("T", b"x".to_vec(), 0);
        env.retry_count = 0;
        let id = env.message_id;
        persister
            .append(&OperationRecord {
                sequence_number: 0,
                op_code: OpCode::Enqueue,
                message_id: id,
                timestamp: Utc::now(),
                envelope: Some(env),
                dead_letter: None,
            })
            .await
            .unwrap();
        persister
            .append(&OperationRecord {
                sequence_number: 1,
                op_code: OpCode::Checkout,
                message_id: id,
                timestamp: Utc::now() - chrono::Duration::seconds(120),
                envelope: None,
                dead_letter: None,
            })
            .await
            .unwrap();

        let recovered = RecoveryService::recover(&options, chrono::Duration::seconds(60)).await.unwrap();
        assert!(recovered.messages.is_empty());
        assert_eq!(recovered.dead_letter_messages.len(), 1);
        let dead_letter = &recovered.dead_letter_messages[0];
        assert_eq!(dead_letter.envelope.message_id, id);
        assert_eq!(dead_letter.envelope.retry_count, 1);
    }
}
