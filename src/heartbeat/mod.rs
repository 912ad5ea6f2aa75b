//! Outward-facing conveniences layered on top of [`crate::queue::QueueManager`]
//! and [`crate::dispatcher::Dispatcher`]: [`Publisher`] (enqueue + wake the
//! right worker pool in one call) and [`Heartbeat`] (lease extension for
//! handlers whose work outlives one lease), per SPEC_FULL.md §4.9.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{MessageId, QueueError, Result};
use crate::dispatcher::Dispatcher;
use crate::queue::{PublishRequest, QueueManager};

/// Publishes a message and wakes the dispatcher's worker pool for its type in
/// one call, so callers don't have to remember the second step.
pub struct Publisher {
    queue: Arc<QueueManager>,
    dispatcher: Arc<Dispatcher>,
}

impl Publisher {
    pub fn new(queue: Arc<QueueManager>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { queue, dispatcher }
    }

    pub async fn publish(
        &self,
        message_type: impl Into<String>,
        payload: Vec<u8>,
        max_retries: u32,
        request: PublishRequest,
    ) -> Result<MessageId> {
        let message_type = message_type.into();
        let id = self
            .queue
            .enqueue(message_type.clone(), payload, max_retries, request)
            .await?;
        self.dispatcher.notify(&message_type);
        Ok(id)
    }
}

/// A handler's most recent progress report for one in-flight message.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub progress_percent: Option<u8>,
    pub progress_message: Option<String>,
    pub last_heartbeat_time: DateTime<Utc>,
}

/// Lease extension for handlers doing work longer than their configured
/// `lease_duration`. A handler reports progress (directly or via
/// [`Heartbeat::spawn_auto_extend`]); a handler that stops reporting is
/// treated the same as a crashed worker — the lease expires and
/// [`crate::lease::LeaseMonitor`] requeues it.
///
/// Progress records are kept in a dashmap keyed by `message_id`, separate
/// from the lease itself, since progress is informational and must survive
/// independent of whatever the buffer does with the envelope between calls.
#[derive(Clone)]
pub struct Heartbeat {
    queue: Arc<QueueManager>,
    progress: Arc<DashMap<MessageId, ProgressRecord>>,
}

impl Heartbeat {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            progress: Arc::new(DashMap::new()),
        }
    }

    /// Pushes `message_id`'s lease expiry forward by `new_duration` from now
    /// and records the handler's progress report alongside it.
    ///
    /// `progress_percent`, if given, must be in `0..=100`. Fails with
    /// `NotFound` if the message is no longer in flight (already
    /// acknowledged, requeued, or dead-lettered) — a late heartbeat racing
    /// the end of processing, not a bug to propagate as a handler error. The
    /// progress record is removed in that case too, since there is no longer
    /// an active message for it to describe.
    pub async fn extend(
        &self,
        message_id: MessageId,
        new_duration: Duration,
        progress_percent: Option<u8>,
        progress_message: Option<String>,
    ) -> Result<()> {
        if let Some(percent) = progress_percent {
            if percent > 100 {
                return Err(QueueError::ConfigurationInvalid(format!(
                    "progress_percent must be between 0 and 100, got {percent}"
                )));
            }
        }

        let result = self.queue.extend_lease(message_id, new_duration).await;
        if result.is_err() {
            self.progress.remove(&message_id);
            return result;
        }

        self.progress.insert(
            message_id,
            ProgressRecord {
                progress_percent,
                progress_message,
                last_heartbeat_time: Utc::now(),
            },
        );
        Ok(())
    }

    /// The most recent progress report for `message_id`, if any heartbeat has
    /// been recorded for it.
    pub fn progress(&self, message_id: MessageId) -> Option<ProgressRecord> {
        self.progress.get(&message_id).map(|entry| entry.clone())
    }

    /// The timestamp of the most recent heartbeat for `message_id`, if any.
    pub fn last_heartbeat_time(&self, message_id: MessageId) -> Option<DateTime<Utc>> {
        self.progress.get(&message_id).map(|entry| entry.last_heartbeat_time)
    }

    /// Spawns a task that calls [`Heartbeat::extend`] every `interval` until
    /// `cancellation` fires. The handler should cancel this token itself as
    /// soon as it finishes, successfully or not, so a stale extend never
    /// outlives the work it was covering.
    pub fn spawn_auto_extend(
        &self,
        message_id: MessageId,
        interval: Duration,
        new_duration: Duration,
        cancellation: CancellationToken,
    ) -> JoinHandle<()> {
        let heartbeat = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = heartbeat.extend(message_id, new_duration, None, None).await {
                    tracing::debug!(message_id = %message_id, error = %err, "heartbeat stopped extending lease");
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::dispatcher::{HandlerFailure, HandlerMessage, MessageHandler, SharedHandlerFactory};
    use crate::config::HandlerOptions;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(
            &self,
            _message: HandlerMessage,
            _cancellation: CancellationToken,
        ) -> std::result::Result<(), HandlerFailure> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_wakes_registered_worker() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 8,
                persistence_enabled: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::new(queue.clone()));
        dispatcher
            .register_handler(
                "T",
                Arc::new(SharedHandlerFactory::new(NoopHandler)),
                HandlerOptions::default(),
            )
            .await
            .unwrap();

        let publisher = Publisher::new(queue.clone(), dispatcher.clone());
        publisher
            .publish("T", b"x".to_vec(), 3, PublishRequest::default())
            .await
            .unwrap();

        for _ in 0..50 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(queue.is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_extends_in_flight_lease() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 8,
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
            .checkout("T", "h1", Duration::from_secs(1))
            .await
            .unwrap();

        let heartbeat = Heartbeat::new(queue.clone());
        let before = queue.get(id).unwrap().lease.unwrap().extension_count;
        heartbeat
            .extend(id, Duration::from_secs(30), Some(40), Some("halfway".into()))
            .await
            .unwrap();
        let after = queue.get(id).unwrap().lease.unwrap().extension_count;
        assert_eq!(after, before + 1);

        let record = heartbeat.progress(id).unwrap();
        assert_eq!(record.progress_percent, Some(40));
        assert_eq!(record.progress_message.as_deref(), Some("halfway"));
        assert!(heartbeat.last_heartbeat_time(id).is_some());
    }

    #[tokio::test]
    async fn extend_rejects_out_of_range_progress_percent() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 8,
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
            .checkout("T", "h1", Duration::from_secs(1))
            .await
            .unwrap();

        let heartbeat = Heartbeat::new(queue.clone());
        let err = heartbeat
            .extend(id, Duration::from_secs(30), Some(101), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::core::QueueError::ConfigurationInvalid(_)));
        assert!(heartbeat.progress(id).is_none());
    }

    #[tokio::test]
    async fn extend_on_finished_message_clears_progress_and_fails() {
        let queue = Arc::new(
            QueueManager::new(QueueOptions {
                capacity: 8,
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
            .checkout("T", "h1", Duration::from_secs(1))
            .await
            .unwrap();

        let heartbeat = Heartbeat::new(queue.clone());
        heartbeat
            .extend(id, Duration::from_secs(30), Some(10), None)
            .await
            .unwrap();
        queue.acknowledge(id).await.unwrap();

        assert!(heartbeat
            .extend(id, Duration::from_secs(30), Some(20), None)
            .await
            .is_err());
        assert!(heartbeat.progress(id).is_none());
    }
}
