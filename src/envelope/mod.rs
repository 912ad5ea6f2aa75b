//! The queue's data model: [`MessageEnvelope`], [`DeadLetterEnvelope`],
//! [`OperationRecord`], and [`QueueSnapshot`], plus their canonical codec.

mod codec;

pub use codec::{decode_envelope, decode_snapshot, encode_envelope, encode_snapshot};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::MessageId;

/// Status of a [`MessageEnvelope`] within the buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageStatus {
    Ready,
    InFlight,
    DeadLetter,
    Superseded,
}

/// An exclusive, time-bounded claim by a worker on a checked-out message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub handler_id: String,
    pub checkout_time: DateTime<Utc>,
    pub lease_expiry: DateTime<Utc>,
    pub extension_count: u32,
}

/// Correlation/trace metadata carried alongside the payload.
///
/// `headers` is a `BTreeMap` rather than a `HashMap` so that canonical
/// serialization is deterministic (see SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageMetadata {
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub source: Option<String>,
    pub schema_version: u32,
}

/// The primary queue record: a payload plus its routing, retry, and lease
/// state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub deduplication_key: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub last_persisted_version: u64,
    pub metadata: MessageMetadata,
    pub enqueued_at: DateTime<Utc>,
    pub is_superseded: bool,
}

impl MessageEnvelope {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            message_id: MessageId::new(),
            message_type: message_type.into(),
            payload,
            deduplication_key: None,
            status: MessageStatus::Ready,
            retry_count: 0,
            max_retries,
            not_before: None,
            lease: None,
            last_persisted_version: 0,
            metadata: MessageMetadata::default(),
            enqueued_at: now,
            is_superseded: false,
        }
    }

    pub fn is_eligible_for_checkout(&self, message_type: &str, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Ready
            && !self.is_superseded
            && self.message_type == message_type
            && self.not_before.is_none_or(|nb| now >= nb)
    }
}

/// A [`MessageEnvelope`] that exhausted retries (or was explicitly rejected),
/// carrying failure metadata for diagnosis and replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    pub envelope: MessageEnvelope,
    pub failure_reason: String,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub exception_stack: Option<String>,
    pub failure_timestamp: DateTime<Utc>,
    pub last_handler_id: Option<String>,
}

/// The operation codes recorded in the write-ahead journal (SPEC_FULL.md §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Enqueue = 0,
    Replace = 1,
    Checkout = 2,
    Acknowledge = 3,
    Requeue = 4,
    LeaseRenew = 5,
    DeadLetter = 6,
    DeadLetterReplay = 7,
    DeadLetterPurge = 8,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Enqueue,
            1 => Self::Replace,
            2 => Self::Checkout,
            3 => Self::Acknowledge,
            4 => Self::Requeue,
            5 => Self::LeaseRenew,
            6 => Self::DeadLetter,
            7 => Self::DeadLetterReplay,
            8 => Self::DeadLetterPurge,
            _ => return None,
        })
    }
}

/// A single write-ahead journal entry.
///
/// `envelope` carries the full envelope for `Enqueue`/`Replace` (and, for
/// `DeadLetter`, the `DeadLetterEnvelope` is encoded separately in
/// `dead_letter`); all other op codes carry only the `message_id` needed to
/// locate the affected record during replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub sequence_number: u64,
    pub op_code: OpCode,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub envelope: Option<MessageEnvelope>,
    pub dead_letter: Option<DeadLetterEnvelope>,
}

/// A point-in-time image of all non-terminal state, written atomically to
/// disk so the journal can be truncated behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub capacity: usize,
    pub messages: Vec<MessageEnvelope>,
    pub deduplication_index: BTreeMap<String, MessageId>,
    pub dead_letter_messages: Vec<DeadLetterEnvelope>,
}
