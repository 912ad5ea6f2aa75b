//! Durable write-ahead journal plus periodic snapshots, per SPEC_FULL.md §4.4.
//!
//! Grounded on the teacher's `persist/runtime/journal_and_snapshot.rs`
//! (`append_record`, `write_snapshot_file`, `compact_journal_path`), which
//! this module generalizes from entity command records to queue
//! [`OperationRecord`]s.

pub mod journal;
pub mod snapshot;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::config::PersistenceOptions;
use crate::core::Result;
use crate::envelope::{OperationRecord, QueueSnapshot};

use journal::JournalWriter;

/// Owns the on-disk journal handle and coordinates snapshot rotation.
///
/// Appends are serialized through an internal `tokio::sync::Mutex` (matching
/// the teacher's single-writer journal discipline); readers use the free
/// functions in [`journal`] and [`snapshot`] directly since recovery runs
/// before a `Persister` is constructed.
pub struct Persister {
    options: PersistenceOptions,
    writer: Mutex<JournalWriter>,
    ops_since_snapshot: AtomicUsize,
    last_snapshot_version: AtomicU64,
    last_snapshot_at: SyncMutex<chrono::DateTime<Utc>>,
}

impl Persister {
    /// Opens (creating if necessary) the journal file described by `options`.
    /// Does not read or replay anything; call [`crate::recovery::RecoveryService::recover`]
    /// first if prior state should be restored.
    pub async fn open(options: PersistenceOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&options.storage_path).await?;
        let writer = JournalWriter::open(
            &options.journal_path(),
            options.serialization_format,
            options.durability,
        )
        .await?;
        Ok(Self {
            options,
            writer: Mutex::new(writer),
            ops_since_snapshot: AtomicUsize::new(0),
            last_snapshot_version: AtomicU64::new(0),
            last_snapshot_at: SyncMutex::new(Utc::now()),
        })
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.options
    }

    /// Appends one operation record to the journal.
    pub async fn append(&self, record: &OperationRecord) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.append(record).await?;
        self.ops_since_snapshot.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// True once enough operations have accumulated since the last snapshot
    /// (`snapshot_threshold`) or enough time has passed (`snapshot_interval`),
    /// per SPEC_FULL.md §4.4 — whichever trips first.
    pub fn should_snapshot(&self) -> bool {
        let op_count_tripped =
            self.ops_since_snapshot.load(Ordering::Relaxed) >= self.options.snapshot_threshold;
        let time_tripped = {
            let last = *self.last_snapshot_at.lock();
            let elapsed = Utc::now() - last;
            elapsed.to_std().unwrap_or(std::time::Duration::ZERO) >= self.options.snapshot_interval
        };
        op_count_tripped || time_tripped
    }

    /// Writes `snapshot` atomically, then truncates the journal behind it —
    /// everything the snapshot captured no longer needs replaying.
    pub async fn write_snapshot(&self, snapshot: &QueueSnapshot) -> Result<()> {
        snapshot::write_atomic(
            &self.options.snapshot_path(),
            snapshot,
            self.options.serialization_format,
        )
        .await?;

        let mut writer = self.writer.lock().await;
        journal::truncate(&self.options.journal_path()).await?;
        *writer = JournalWriter::open(
            &self.options.journal_path(),
            self.options.serialization_format,
            self.options.durability,
        )
        .await?;

        self.ops_since_snapshot.store(0, Ordering::Relaxed);
        self.last_snapshot_version
            .store(snapshot.version, Ordering::Relaxed);
        *self.last_snapshot_at.lock() = Utc::now();
        Ok(())
    }

    pub fn last_snapshot_version(&self) -> u64 {
        self.last_snapshot_version.load(Ordering::Relaxed)
    }
}
