//! Per-message-type worker pools that drain checkouts and invoke the
//! host-registered handler, per SPEC_FULL.md §4.8.
//!
//! Grounded on the teacher's `RegisteredDeterministicCommand` handler
//! registry shape (`persist/runtime/handlers_and_envelope/`), generalized
//! from a fixed command table to a dynamically scalable worker pool per
//! message type.

pub mod handler;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HandlerOptions;
use crate::core::{QueueError, Result};
use crate::queue::{QueueManager, RequeueOutcome};

pub use handler::{HandlerFactory, HandlerFailure, HandlerMessage, MessageHandler, SharedHandlerFactory};

/// A worker checks the wake channel, then the fallback poll tick, whichever
/// comes first — so a notify() that races a checkout is never lost for long.
const FALLBACK_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

/// Rolling window over which `throughput_per_second` is computed.
const THROUGHPUT_WINDOW: StdDuration = StdDuration::from_secs(60);
/// Cap on retained handler-duration samples for the rolling average.
const DURATION_SAMPLE_CAP: usize = 1000;

/// Point-in-time counters for one message type's worker pool.
#[derive(Debug, Default)]
pub struct TypeMetrics {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub active_workers: AtomicUsize,
    duration_samples: Mutex<VecDeque<StdDuration>>,
    completion_timestamps: Mutex<VecDeque<DateTime<Utc>>>,
}

impl TypeMetrics {
    /// Records one completed handler invocation (success, failure, or
    /// timeout all count — each occupied a worker for that long).
    fn record_completion(&self, duration: StdDuration) {
        let mut samples = self.duration_samples.lock();
        if samples.len() >= DURATION_SAMPLE_CAP {
            samples.pop_front();
        }
        samples.push_back(duration);
        drop(samples);

        let mut timestamps = self.completion_timestamps.lock();
        timestamps.push_back(Utc::now());
        prune_timestamps(&mut timestamps);
    }

    /// Mean of the last ≤1000 handler durations, or `None` if nothing has
    /// completed yet.
    pub fn average_handler_duration(&self) -> Option<StdDuration> {
        let samples = self.duration_samples.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<StdDuration>() / samples.len() as u32)
    }

    /// Completions per second over the trailing `THROUGHPUT_WINDOW`.
    pub fn throughput_per_second(&self) -> f64 {
        let mut timestamps = self.completion_timestamps.lock();
        prune_timestamps(&mut timestamps);
        timestamps.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64()
    }
}

fn prune_timestamps(timestamps: &mut VecDeque<DateTime<Utc>>) {
    let now = Utc::now();
    let window = chrono::Duration::from_std(THROUGHPUT_WINDOW).unwrap_or_default();
    while timestamps.front().is_some_and(|t| now - *t > window) {
        timestamps.pop_front();
    }
}

struct WorkerHandle {
    cancellation: CancellationToken,
    join: JoinHandle<()>,
}

enum WakeSender {
    Unbounded(mpsc::UnboundedSender<()>),
    Coalescing(mpsc::Sender<()>),
}

impl WakeSender {
    fn notify(&self) {
        match self {
            Self::Unbounded(tx) => {
                let _ = tx.send(());
            }
            Self::Coalescing(tx) => {
                let _ = tx.try_send(());
            }
        }
    }
}

struct Pool {
    message_type: String,
    options: HandlerOptions,
    factory: Arc<dyn HandlerFactory>,
    wake: WakeSender,
    wake_rx: Arc<tokio::sync::Mutex<WakeReceiver>>,
    workers: Mutex<Vec<WorkerHandle>>,
    metrics: Arc<TypeMetrics>,
}

enum WakeReceiver {
    Unbounded(mpsc::UnboundedReceiver<()>),
    Coalescing(mpsc::Receiver<()>),
}

impl WakeReceiver {
    async fn recv(&mut self) {
        match self {
            Self::Unbounded(rx) => {
                rx.recv().await;
            }
            Self::Coalescing(rx) => {
                rx.recv().await;
            }
        }
    }
}

/// Owns every registered handler's worker pool and the channel used to wake
/// its workers after a publish.
pub struct Dispatcher {
    queue: Arc<QueueManager>,
    pools: DashMap<String, Arc<Pool>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            pools: DashMap::new(),
        }
    }

    /// Registers a handler for `message_type` and spawns its initial
    /// `min_parallelism` workers. Re-registering a type is rejected.
    pub async fn register_handler(
        &self,
        message_type: impl Into<String>,
        factory: Arc<dyn HandlerFactory>,
        options: HandlerOptions,
    ) -> Result<()> {
        options.validate()?;
        let message_type = message_type.into();
        if self.pools.contains_key(&message_type) {
            return Err(QueueError::InvalidState(format!(
                "handler already registered for message type '{message_type}'"
            )));
        }

        let (wake, wake_rx) = match options.channel_mode {
            crate::config::ChannelMode::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (WakeSender::Unbounded(tx), WakeReceiver::Unbounded(rx))
            }
            crate::config::ChannelMode::BoundedCoalescing => {
                let (tx, rx) = mpsc::channel(1);
                (WakeSender::Coalescing(tx), WakeReceiver::Coalescing(rx))
            }
        };

        let pool = Arc::new(Pool {
            message_type: message_type.clone(),
            options: options.clone(),
            factory,
            wake,
            wake_rx: Arc::new(tokio::sync::Mutex::new(wake_rx)),
            workers: Mutex::new(Vec::new()),
            metrics: Arc::new(TypeMetrics::default()),
        });

        self.pools.insert(message_type.clone(), pool.clone());
        self.scale(&message_type, options.min_parallelism).await?;
        Ok(())
    }

    /// Wakes idle workers for `message_type`; cheap and best-effort, a missed
    /// signal is caught by the fallback poll.
    pub fn notify(&self, message_type: &str) {
        if let Some(pool) = self.pools.get(message_type) {
            pool.wake.notify();
        }
    }

    /// Adjusts the live worker count for `message_type` to `target`, clamped
    /// to the handler's configured `[min_parallelism, max_parallelism]`.
    pub async fn scale(&self, message_type: &str, target: usize) -> Result<()> {
        let pool = self
            .pools
            .get(message_type)
            .ok_or_else(|| {
                QueueError::KeyNotFound(format!("no handler registered for message type '{message_type}'"))
            })?
            .clone();
        let target = target.clamp(pool.options.min_parallelism, pool.options.max_parallelism);

        let mut workers = pool.workers.lock();
        while workers.len() < target {
            workers.push(self.spawn_worker(&pool));
        }
        while workers.len() > target {
            if let Some(handle) = workers.pop() {
                handle.cancellation.cancel();
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, pool: &Arc<Pool>) -> WorkerHandle {
        let cancellation = CancellationToken::new();
        let worker_cancellation = cancellation.clone();
        let queue = self.queue.clone();
        let pool = pool.clone();
        let handler_id = format!("{}-{}", pool.message_type, uuid::Uuid::now_v7());

        pool.metrics.active_workers.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            run_worker(queue, pool.clone(), handler_id, worker_cancellation).await;
            pool.metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
        });

        WorkerHandle {
            cancellation,
            join,
        }
    }

    pub fn metrics(&self, message_type: &str) -> Option<Arc<TypeMetrics>> {
        self.pools.get(message_type).map(|p| p.metrics.clone())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    /// Cancels every worker across every pool and waits for them to exit.
    pub async fn shutdown(&self) {
        let mut joins = Vec::new();
        for pool in self.pools.iter() {
            let mut workers = pool.workers.lock();
            for handle in workers.drain(..) {
                handle.cancellation.cancel();
                joins.push(handle.join);
            }
        }
        for join in joins {
            let _ = join.await;
        }
    }
}

async fn run_worker(
    queue: Arc<QueueManager>,
    pool: Arc<Pool>,
    handler_id: String,
    cancellation: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = wait_for_wake(&pool) => {}
            _ = tokio::time::sleep(FALLBACK_POLL_INTERVAL) => {}
        }

        loop {
            if cancellation.is_cancelled() {
                return;
            }
            let checkout = queue
                .checkout(&pool.message_type, &handler_id, pool.options.lease_duration)
                .await;
            let envelope = match checkout {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(message_type = %pool.message_type, error = %err, "checkout failed");
                    break;
                }
            };

            let message_id = envelope.message_id;
            let handler = pool.factory.create().await;
            let message = HandlerMessage::from(envelope);
            let work_token = cancellation.child_token();

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                pool.options.timeout,
                handler.handle(message, work_token),
            )
            .await;
            pool.metrics.record_completion(started.elapsed());

            match outcome {
                Ok(Ok(())) => {
                    if let Err(err) = queue.acknowledge(message_id).await {
                        tracing::warn!(message_id = %message_id, error = %err, "acknowledge failed");
                    }
                    pool.metrics.processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(failure)) => {
                    record_failure(&queue, &pool, message_id, failure).await;
                }
                Err(_elapsed) => {
                    record_failure(
                        &queue,
                        &pool,
                        message_id,
                        HandlerFailure::new("handler exceeded its timeout"),
                    )
                    .await;
                }
            }
        }
    }
}

async fn wait_for_wake(pool: &Pool) {
    let mut rx = pool.wake_rx.lock().await;
    rx.recv().await;
}

async fn record_failure(
    queue: &QueueManager,
    pool: &Pool,
    message_id: crate::core::MessageId,
    failure: HandlerFailure,
) {
    pool.metrics.failed.fetch_add(1, Ordering::Relaxed);
    let result = queue
        .requeue(
            message_id,
            pool.options.backoff_strategy,
            pool.options.initial_backoff,
            pool.options.max_backoff,
            failure.reason,
            failure.exception_type,
            failure.exception_message,
        )
        .await;
    match result {
        Ok(RequeueOutcome::DeadLettered(_)) => {
            pool.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(RequeueOutcome::Requeued(_)) => {}
        Err(err) => {
            tracing::warn!(message_id = %message_id, error = %err, "failed to requeue after handler failure");
        }
    }
}
