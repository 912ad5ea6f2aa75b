//! Embedded, in-process durable message queue.
//!
//! Provides at-least-once delivery, keyed deduplication, leased checkouts,
//! retry with backoff, a dead-letter queue, and crash recovery via a
//! write-ahead journal plus periodic snapshots. Consumed as a library: the
//! host owns the process, registers [`dispatcher::MessageHandler`]s per
//! message type, and publishes through [`QueueEngine`].

pub mod buffer;
pub mod config;
pub mod core;
pub mod dedup;
pub mod dispatcher;
pub mod dlq;
pub mod envelope;
pub mod heartbeat;
pub mod lease;
pub mod persist;
pub mod queue;
pub mod recovery;

use std::sync::Arc;

pub use buffer::BufferCounts;
pub use config::{
    BackoffStrategy, ChannelMode, DeduplicationMode, HandlerOptions, JournalDurabilityMode,
    PersistenceOptions, QueueOptions, SerializationFormat,
};
pub use core::{MessageId, QueueError, Result};
pub use dispatcher::{Dispatcher, HandlerFactory, HandlerFailure, HandlerMessage, MessageHandler, SharedHandlerFactory};
pub use dlq::{DeadLetterMetrics, DeadLetterQueue};
pub use envelope::{DeadLetterEnvelope, Lease, MessageEnvelope, MessageMetadata, MessageStatus};
pub use heartbeat::{Heartbeat, Publisher};
pub use lease::LeaseMonitor;
pub use queue::{PublishRequest, QueueManager, RequeueOutcome};

/// Top-level facade wiring a [`QueueManager`], its [`Dispatcher`], and a
/// background [`LeaseMonitor`] into one handle. Most hosts only need this;
/// the individual components remain public for hosts that want to assemble
/// their own lifecycle (e.g. a custom shutdown sequence).
pub struct QueueEngine {
    pub queue: Arc<QueueManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub publisher: Publisher,
    pub heartbeat: Heartbeat,
    lease_monitor: LeaseMonitor,
}

impl QueueEngine {
    /// Builds the queue (running recovery first if `persistence_options` is
    /// given), wires up the dispatcher, and starts the lease monitor.
    pub async fn start(
        queue_options: QueueOptions,
        persistence_options: Option<PersistenceOptions>,
    ) -> Result<Self> {
        let queue = if queue_options.persistence_enabled {
            let persistence = persistence_options.ok_or_else(|| {
                QueueError::ConfigurationInvalid(
                    "persistence_enabled requires PersistenceOptions".into(),
                )
            })?;
            Arc::new(QueueManager::open(queue_options.clone(), persistence).await?)
        } else {
            Arc::new(QueueManager::new(queue_options.clone())?)
        };

        let dispatcher = Arc::new(Dispatcher::new(queue.clone()));
        let publisher = Publisher::new(queue.clone(), dispatcher.clone());
        let heartbeat = Heartbeat::new(queue.clone());
        let lease_monitor = LeaseMonitor::new(queue.clone(), queue_options.lease_monitor_interval);
        lease_monitor.start().await?;

        Ok(Self {
            queue,
            dispatcher,
            publisher,
            heartbeat,
            lease_monitor,
        })
    }

    /// Registers a handler for `message_type`, per SPEC_FULL.md §4.8.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
        options: HandlerOptions,
    ) -> Result<()> {
        self.dispatcher
            .register_handler(message_type, factory, options)
            .await
    }

    /// Stops the lease monitor and every worker, then writes a final
    /// snapshot so the next startup's journal replay is as short as possible.
    pub async fn shutdown(&self) -> Result<()> {
        self.lease_monitor.stop().await;
        self.dispatcher.shutdown().await;
        self.queue.force_snapshot().await
    }
}
