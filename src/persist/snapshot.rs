//! Atomic snapshot writer/reader.
//!
//! A snapshot file is a fixed header followed by the encoded payload:
//!
//! ```text
//! [8 bytes magic "DQSNAP01"][i64 LE version][u8 format tag]
//! [u32 LE payload_crc32][u32 LE payload_len][payload]
//! ```
//!
//! `version` in the header is cross-checked against `QueueSnapshot::version`
//! embedded in the decoded payload; a mismatch means the file was renamed
//! into place from a different snapshot cycle than its header claims and is
//! reported as corruption rather than silently trusted.
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over `path` so a
//! reader never observes a half-written snapshot. Grounded on the teacher's
//! `write_snapshot_file` (write-tmp/fsync/rename) in
//! `persist/runtime/journal_and_snapshot.rs`.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::config::SerializationFormat;
use crate::core::{QueueError, Result};
use crate::envelope::QueueSnapshot;

const MAGIC: &[u8; 8] = b"DQSNAP01";
const HEADER_LEN: usize = 8 + 8 + 1 + 4 + 4;

fn format_tag(format: SerializationFormat) -> u8 {
    match format {
        SerializationFormat::Json => 0,
        SerializationFormat::Binary => 1,
    }
}

fn format_from_tag(tag: u8) -> Result<SerializationFormat> {
    match tag {
        0 => Ok(SerializationFormat::Json),
        1 => Ok(SerializationFormat::Binary),
        other => Err(QueueError::PersistenceCorruption(format!(
            "unknown snapshot format tag {other}"
        ))),
    }
}

fn encode_payload(snapshot: &QueueSnapshot, format: SerializationFormat) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Json => serde_json::to_vec(snapshot).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::to_vec(snapshot).map_err(QueueError::from),
    }
}

fn decode_payload(bytes: &[u8], format: SerializationFormat) -> Result<QueueSnapshot> {
    match format {
        SerializationFormat::Json => serde_json::from_slice(bytes).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::from_slice(bytes).map_err(QueueError::from),
    }
}

pub async fn write_atomic(
    path: &Path,
    snapshot: &QueueSnapshot,
    format: SerializationFormat,
) -> Result<()> {
    let payload = encode_payload(snapshot, format)?;
    let crc = crc32fast::hash(&payload);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(snapshot.version as i64).to_le_bytes());
    buf.push(format_tag(format));
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = tmp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    {
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(&buf).await?;
        tmp.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Returns `Ok(None)` if no snapshot file exists yet.
pub async fn read(path: &Path, crc_validation_enabled: bool) -> Result<Option<QueueSnapshot>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path).await?;
    if bytes.len() < HEADER_LEN {
        return Err(QueueError::PersistenceCorruption(
            "snapshot file shorter than its header".into(),
        ));
    }
    if &bytes[0..8] != MAGIC {
        return Err(QueueError::PersistenceCorruption(
            "snapshot file missing magic header".into(),
        ));
    }
    let header_version = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let format_tag_byte = bytes[16];
    let format = format_from_tag(format_tag_byte)?;
    let crc = u32::from_le_bytes(bytes[17..21].try_into().unwrap());
    let payload_len = u32::from_le_bytes(bytes[21..25].try_into().unwrap()) as usize;
    let payload = bytes.get(HEADER_LEN..HEADER_LEN + payload_len).ok_or_else(|| {
        QueueError::PersistenceCorruption("snapshot payload shorter than declared length".into())
    })?;
    if crc_validation_enabled && crc32fast::hash(payload) != crc {
        return Err(QueueError::PersistenceCorruption(
            "snapshot payload failed CRC validation".into(),
        ));
    }
    let decoded = decode_payload(payload, format)?;
    if decoded.version as i64 != header_version {
        return Err(QueueError::PersistenceCorruption(format!(
            "snapshot header version {header_version} does not match payload version {}",
            decoded.version
        )));
    }
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn sample_snapshot() -> QueueSnapshot {
        QueueSnapshot {
            version: 1,
            created_at: chrono::Utc::now(),
            capacity: 100,
            messages: vec![crate::envelope::MessageEnvelope::new(
                "T",
                b"x".to_vec(),
                3,
            )],
            deduplication_index: BTreeMap::new(),
            dead_letter_messages: Vec::new(),
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        let snap = sample_snapshot();
        write_atomic(&path, &snap, SerializationFormat::Json)
            .await
            .unwrap();
        let loaded = read(&path, true).await.unwrap().unwrap();
        assert_eq!(loaded.version, snap.version);
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(read(&path, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.bin");
        write_atomic(&path, &sample_snapshot(), SerializationFormat::Json)
            .await
            .unwrap();
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        tokio::fs::write(&path, bytes).await.unwrap();
        assert!(read(&path, true).await.is_err());
    }
}
