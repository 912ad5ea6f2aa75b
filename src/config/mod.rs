//! Configuration surface for the queue, its handlers, and its persistence layer.
//!
//! The host builds these structs however it likes (env, file, hardcoded) and
//! passes them in; this crate never reads configuration sources itself, it
//! only validates and consumes what it's given.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{QueueError, Result};

/// Backoff strategy applied when a message is requeued after a handler failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Messages become eligible for checkout immediately.
    None,
    /// Always wait `initial_backoff`.
    Fixed,
    /// Wait `initial_backoff * retry_count`.
    Linear,
    /// Wait `initial_backoff * 2^(retry_count - 1)`.
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Computes the `not_before` delay for a given retry attempt under a strategy,
/// capped at `max_backoff`.
///
/// Mirrors the teacher's `retry_backoff_ms` formula (`base * 2^(attempt-1)`,
/// clamped to `max`), generalized across the four documented strategies.
pub fn compute_backoff(
    strategy: BackoffStrategy,
    retry_count: u32,
    initial: Duration,
    max: Duration,
) -> Option<Duration> {
    let delay = match strategy {
        BackoffStrategy::None => return None,
        BackoffStrategy::Fixed => initial,
        BackoffStrategy::Linear => initial.saturating_mul(retry_count.max(1)),
        BackoffStrategy::Exponential => {
            let factor = 2u32.saturating_pow(retry_count.saturating_sub(1));
            initial.saturating_mul(factor)
        }
    };
    Some(delay.min(max))
}

/// Deduplication behavior when a replace lands on an already-dead-lettered or
/// otherwise terminal key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeduplicationMode {
    /// Only one non-terminal envelope per key, enforced by replace-in-place.
    Strict,
    /// Every publish is admitted; the dedup key is informational only.
    Append,
}

impl Default for DeduplicationMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Dispatcher signal-channel policy for a handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelMode {
    /// Every enqueue notification is retained; workers drain one at a time.
    Unbounded,
    /// Small bounded channel; excess notifications are dropped since workers
    /// spin to drain checkouts regardless of signal count.
    BoundedCoalescing,
}

impl Default for ChannelMode {
    fn default() -> Self {
        Self::Unbounded
    }
}

/// Per-handler (per message type) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOptions {
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
    pub enable_lease_extension: bool,
    pub deduplication_mode: DeduplicationMode,
    pub backoff_strategy: BackoffStrategy,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub channel_mode: ChannelMode,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            min_parallelism: 1,
            max_parallelism: 4,
            timeout: Duration::from_secs(30),
            max_retries: 5,
            lease_duration: Duration::from_secs(60),
            enable_lease_extension: true,
            deduplication_mode: DeduplicationMode::default(),
            backoff_strategy: BackoffStrategy::default(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            channel_mode: ChannelMode::default(),
        }
    }
}

impl HandlerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.min_parallelism == 0 {
            return Err(QueueError::ConfigurationInvalid(
                "min_parallelism must be >= 1".into(),
            ));
        }
        if self.min_parallelism > self.max_parallelism {
            return Err(QueueError::ConfigurationInvalid(format!(
                "min_parallelism ({}) must be <= max_parallelism ({})",
                self.min_parallelism, self.max_parallelism
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(QueueError::ConfigurationInvalid(format!(
                "initial_backoff ({:?}) must be <= max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.lease_duration < self.timeout {
            return Err(QueueError::ConfigurationInvalid(format!(
                "lease_duration ({:?}) should be >= timeout ({:?})",
                self.lease_duration, self.timeout
            )));
        }
        Ok(())
    }
}

/// Durability mode for journal appends.
///
/// Mirrors the teacher's `RuntimeDurabilityMode`: `Strict` fsyncs every
/// append, `Eventual` batches fsyncs on an interval for throughput at the
/// cost of losing the tail on a crash.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalDurabilityMode {
    Strict,
    Eventual { sync_interval_ms: u64 },
}

impl Default for JournalDurabilityMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Binary wire format for envelope and journal payload bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SerializationFormat {
    Json,
    Binary,
}

impl Default for SerializationFormat {
    fn default() -> Self {
        Self::Json
    }
}

/// Persistence-layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceOptions {
    pub storage_path: PathBuf,
    pub journal_file_name: String,
    pub snapshot_file_name: String,
    #[serde(with = "duration_millis")]
    pub snapshot_interval: Duration,
    pub snapshot_threshold: usize,
    pub crc_validation_enabled: bool,
    pub serialization_format: SerializationFormat,
    pub snapshot_retention_count: usize,
    pub durability: JournalDurabilityMode,
    /// If the snapshot file fails CRC validation at recovery, start from an
    /// empty snapshot and replay the full journal instead of failing startup
    /// outright. A corrupt *journal* record is never tolerated this way: it
    /// means real data between the last snapshot and the crash is gone.
    pub start_empty_on_corrupt_snapshot: bool,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data"),
            journal_file_name: "queue_journal.log".to_string(),
            snapshot_file_name: "queue_snapshot.bin".to_string(),
            snapshot_interval: Duration::from_secs(300),
            snapshot_threshold: 1_000,
            crc_validation_enabled: true,
            serialization_format: SerializationFormat::default(),
            snapshot_retention_count: 1,
            durability: JournalDurabilityMode::default(),
            start_empty_on_corrupt_snapshot: false,
        }
    }
}

impl PersistenceOptions {
    pub fn journal_path(&self) -> PathBuf {
        self.storage_path.join(&self.journal_file_name)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.storage_path.join(&self.snapshot_file_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_threshold == 0 {
            return Err(QueueError::ConfigurationInvalid(
                "snapshot_threshold must be >= 1".into(),
            ));
        }
        if self.snapshot_retention_count == 0 {
            return Err(QueueError::ConfigurationInvalid(
                "snapshot_retention_count must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    pub capacity: usize,
    pub persistence_enabled: bool,
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    #[serde(with = "duration_millis")]
    pub lease_monitor_interval: Duration,
    pub deduplication_enabled: bool,
    pub dead_letter_capacity: usize,
    pub default_backoff_strategy: BackoffStrategy,
    #[serde(with = "duration_millis")]
    pub default_initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub default_max_backoff: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            persistence_enabled: true,
            default_timeout: Duration::from_secs(30),
            default_max_retries: 5,
            lease_monitor_interval: Duration::from_secs(5),
            deduplication_enabled: true,
            dead_letter_capacity: 10_000,
            default_backoff_strategy: BackoffStrategy::default(),
            default_initial_backoff: Duration::from_millis(100),
            default_max_backoff: Duration::from_secs(30),
        }
    }
}

impl QueueOptions {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(QueueError::ConfigurationInvalid(
                "capacity must be >= 1".into(),
            ));
        }
        if self.default_initial_backoff > self.default_max_backoff {
            return Err(QueueError::ConfigurationInvalid(
                "default_initial_backoff must be <= default_max_backoff".into(),
            ));
        }
        if self.lease_monitor_interval < Duration::from_secs(1)
            || self.lease_monitor_interval > Duration::from_secs(10)
        {
            return Err(QueueError::ConfigurationInvalid(
                "lease_monitor_interval must be between 1s and 10s".into(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exponential_caps_at_max() {
        let max = Duration::from_secs(5);
        let got = compute_backoff(
            BackoffStrategy::Exponential,
            10,
            Duration::from_millis(100),
            max,
        );
        assert_eq!(got, Some(max));
    }

    #[test]
    fn backoff_none_is_null() {
        assert_eq!(
            compute_backoff(
                BackoffStrategy::None,
                3,
                Duration::from_millis(100),
                Duration::from_secs(5)
            ),
            None
        );
    }

    #[test]
    fn backoff_linear_scales_with_retry_count() {
        let got = compute_backoff(
            BackoffStrategy::Linear,
            3,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        assert_eq!(got, Some(Duration::from_millis(300)));
    }

    #[test]
    fn handler_options_rejects_inverted_parallelism() {
        let mut opts = HandlerOptions::default();
        opts.min_parallelism = 8;
        opts.max_parallelism = 2;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn queue_options_rejects_zero_capacity() {
        let mut opts = QueueOptions::default();
        opts.capacity = 0;
        assert!(opts.validate().is_err());
    }
}
