//! Background sweep that requeues messages whose lease has expired without
//! an acknowledgement or explicit requeue, per SPEC_FULL.md §4.7.
//!
//! Grounded on the teacher's `RuntimeSnapshotWorker`/`spawn_runtime_snapshot_worker`
//! background-task lifecycle in `persist/runtime/mod.rs`: a single spawned
//! task, woken on a fixed interval, cancelled via a token rather than by
//! dropping a channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{QueueError, Result};
use crate::envelope::MessageStatus;
use crate::queue::QueueManager;

/// Lower bound on the sweep loop's sleep, so a pile of leases expiring in the
/// same instant doesn't spin the task.
const MIN_SLEEP: Duration = Duration::from_secs(1);
/// Upper bound on the sweep loop's sleep when nothing is in flight, so a
/// freshly-expired lease is never discovered more than this late.
const MAX_SLEEP: Duration = Duration::from_secs(10);

pub struct LeaseMonitor {
    queue: Arc<QueueManager>,
    idle_interval: Duration,
    cancellation: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseMonitor {
    pub fn new(queue: Arc<QueueManager>, idle_interval: Duration) -> Self {
        Self {
            queue,
            idle_interval,
            cancellation: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the sweep loop. A second call while already running fails
    /// rather than silently no-op'ing, so callers can't mistake a double
    /// `start` for a fresh monitor with its own cancellation lifecycle.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Err(QueueError::InvalidState(
                "lease monitor is already running".into(),
            ));
        }
        let queue = self.queue.clone();
        let idle_interval = self.idle_interval;
        let cancellation = self.cancellation.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                let sleep_for = next_sleep_duration(&queue, idle_interval);
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tokio::time::sleep(sleep_for) => {
                        sweep_expired_leases(&queue).await;
                    }
                }
            }
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancellation.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// `min(earliest InFlight lease_expiry, now + idle_interval)`, clamped to
/// `[MIN_SLEEP, MAX_SLEEP]` — the sweep wakes up right when the soonest
/// lease can actually expire instead of on a fixed cadence, but never sleeps
/// so long that a quiet queue misses a burst of expiries for ten seconds.
fn next_sleep_duration(queue: &QueueManager, idle_interval: Duration) -> Duration {
    let now = Utc::now();
    let earliest_expiry = queue
        .pending_messages()
        .into_iter()
        .filter(|env| env.status == MessageStatus::InFlight)
        .filter_map(|env| env.lease.map(|lease| lease.lease_expiry))
        .min();

    let idle_target = now
        + chrono::Duration::from_std(idle_interval).unwrap_or_else(|_| chrono::Duration::seconds(1));
    let target = match earliest_expiry {
        Some(expiry) => expiry.min(idle_target),
        None => idle_target,
    };

    let delta = (target - now).to_std().unwrap_or(Duration::ZERO);
    delta.clamp(MIN_SLEEP, MAX_SLEEP)
}

async fn sweep_expired_leases(queue: &QueueManager) {
    let now = Utc::now();
    let options = queue.options().clone();
    for envelope in queue.pending_messages() {
        if envelope.status != MessageStatus::InFlight {
            continue;
        }
        let Some(lease) = &envelope.lease else { continue };
        if lease.lease_expiry > now {
            continue;
        }
        let outcome = queue
            .requeue(
                envelope.message_id,
                options.default_backoff_strategy,
                options.default_initial_backoff,
                options.default_max_backoff,
                "lease expired without acknowledgement",
                None,
                None,
            )
            .await;
        if let Err(err) = outcome {
            tracing::warn!(message_id = %envelope.message_id, error = %err, "lease sweep failed to requeue expired message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::queue::PublishRequest;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn sweep_requeues_expired_lease() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 4,
                persistence_enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let id = queue
            .enqueue("T", b"x".to_vec(), 3, PublishRequest::default())
            .await
            .unwrap();
        queue
            .checkout("T", "h1", StdDuration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        sweep_expired_leases(&queue).await;

        let env = queue.get(id).unwrap();
        assert_eq!(env.status, MessageStatus::Ready);
        assert_eq!(env.retry_count, 1);
    }

    #[tokio::test]
    async fn monitor_start_stop_lifecycle_is_idempotent() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 4,
                persistence_enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let monitor = LeaseMonitor::new(queue, StdDuration::from_millis(20));
        monitor.start().await.unwrap();
        assert!(monitor.start().await.is_err());
        monitor.stop().await;
    }

    #[tokio::test]
    async fn sleep_duration_tracks_earliest_in_flight_expiry() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 4,
                persistence_enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        queue
            .enqueue("T", b"x".to_vec(), 3, PublishRequest::default())
            .await
            .unwrap();
        queue
            .checkout("T", "h1", StdDuration::from_millis(1))
            .await
            .unwrap();

        let sleep_for = next_sleep_duration(&queue, StdDuration::from_secs(20));
        assert_eq!(sleep_for, MIN_SLEEP);
    }

    #[tokio::test]
    async fn sleep_duration_caps_idle_queue_at_ceiling() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 4,
                persistence_enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let sleep_for = next_sleep_duration(&queue, StdDuration::from_secs(3600));
        assert_eq!(sleep_for, MAX_SLEEP);
    }
}
