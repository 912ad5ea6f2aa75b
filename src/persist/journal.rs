//! Length-prefixed, CRC32-framed write-ahead journal.
//!
//! Each record on disk is:
//!
//! ```text
//! [u32 LE payload_len][payload_len bytes][u32 LE crc32(length_header || payload)]
//! ```
//!
//! The CRC covers the length header as well as the payload so that a
//! corrupted length field cannot masquerade as a torn tail write.
//!
//! Grounded on the teacher's `append_record`/journal-scan pair in
//! `persist/runtime/journal_and_snapshot.rs`, generalized from entity command
//! records to [`OperationRecord`]s.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{JournalDurabilityMode, SerializationFormat};
use crate::core::{QueueError, Result};
use crate::envelope::OperationRecord;

fn encode_record(record: &OperationRecord, format: SerializationFormat) -> Result<Vec<u8>> {
    match format {
        SerializationFormat::Json => serde_json::to_vec(record).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::to_vec(record).map_err(QueueError::from),
    }
}

fn decode_record(bytes: &[u8], format: SerializationFormat) -> Result<OperationRecord> {
    match format {
        SerializationFormat::Json => serde_json::from_slice(bytes).map_err(QueueError::from),
        SerializationFormat::Binary => rmp_serde::from_slice(bytes).map_err(QueueError::from),
    }
}

pub struct JournalWriter {
    file: File,
    format: SerializationFormat,
    durability: JournalDurabilityMode,
}

impl JournalWriter {
    pub async fn open(
        path: &Path,
        format: SerializationFormat,
        durability: JournalDurabilityMode,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file,
            format,
            durability,
        })
    }

    /// Appends `record`, fsyncing immediately under `Strict` durability.
    pub async fn append(&mut self, record: &OperationRecord) -> Result<()> {
        let payload = encode_record(record, self.format)?;
        let length_header = (payload.len() as u32).to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&length_header);
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&length_header);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.file.write_all(&frame).await?;
        if matches!(self.durability, JournalDurabilityMode::Strict) {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync_data().await?;
        Ok(())
    }
}

/// Reads every well-formed record from the journal at `path`.
///
/// A trailing partial frame (fewer bytes than the declared `payload_len`, or
/// a truncated length/crc prefix) is treated as evidence of a torn write at
/// the tail and silently dropped, not an error: the write-ahead contract only
/// promises durability up to the last *complete* fsynced frame. A CRC
/// mismatch on an otherwise complete frame is a real corruption and is
/// reported via [`QueueError::PersistenceCorruption`].
pub async fn read_all(path: &Path, format: SerializationFormat) -> Result<Vec<OperationRecord>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(Vec::new());
    }
    let bytes = tokio::fs::read(path).await?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        if offset + 4 > bytes.len() {
            break;
        }
        let length_header = &bytes[offset..offset + 4];
        let len = u32::from_le_bytes(length_header.try_into().unwrap()) as usize;
        let payload_start = offset + 4;
        let payload_end = payload_start + len;
        let crc_end = payload_end + 4;
        if crc_end > bytes.len() {
            break;
        }
        let payload = &bytes[payload_start..payload_end];
        let crc = u32::from_le_bytes(bytes[payload_end..crc_end].try_into().unwrap());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(length_header);
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(QueueError::PersistenceCorruption(format!(
                "journal record at offset {offset} failed CRC validation"
            )));
        }
        records.push(decode_record(payload, format)?);
        offset = crc_end;
    }

    Ok(records)
}

/// Replaces the journal file with an empty one, used right after a snapshot
/// has captured everything the journal described.
pub async fn truncate(path: &Path) -> Result<()> {
    File::create(path).await?;
    Ok(())
}
