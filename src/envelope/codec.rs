//! Canonical encode/decode for envelopes and snapshots.
//!
//! Both `SerializationFormat` variants are canonical: the same logical value
//! always produces the same bytes, because the wire structs use
//! `BTreeMap`/`Vec` and `derive(Serialize)`'s stable field order rather than
//! any hash-iteration-order-dependent shape.

use crate::config::SerializationFormat;
use crate::core::{QueueError, Result};
use crate::envelope::{MessageEnvelope, QueueSnapshot};

pub fn encode_envelope(envelope: &MessageEnvelope, format: SerializationFormat) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Json => {
            serde_json::to_vec(envelope).map_err(QueueError::from)
        }
        SerializationFormat::Binary => {
            rmp_serde::to_vec(envelope).map_err(QueueError::from)
        }
    }
}

pub fn decode_envelope(bytes: &[u8], format: SerializationFormat) -> Result<MessageEnvelope> {
    match format {
        SerializationFormat::Json => serde_json::from_slice(bytes).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::from_slice(bytes).map_err(QueueError::from),
    }
}

pub fn encode_snapshot(snapshot: &QueueSnapshot, format: SerializationFormat) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Json => serde_json::to_vec(snapshot).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::to_vec(snapshot).map_err(QueueError::from),
    }
}

pub fn decode_snapshot(bytes: &[u8], format: SerializationFormat) -> Result<QueueSnapshot> {
    match format {
        SerializationFormat::Json => serde_json::from_slice(bytes).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::from_slice(bytes).map_err(QueueError::from),
    }
}
