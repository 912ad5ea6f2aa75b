//! The host-implemented side of the dispatcher boundary: one [`MessageHandler`]
//! per message type, created per-checkout through a [`HandlerFactory`] so a
//! host can scope per-message state (a DB transaction, a request-scoped
//! client) the way the teacher's command handlers are constructed per call
//! rather than shared mutably across workers.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::MessageId;
use crate::envelope::MessageMetadata;

/// The subset of a [`crate::envelope::MessageEnvelope`] a handler needs; it
/// never sees lease/journal bookkeeping fields.
#[derive(Debug, Clone)]
pub struct HandlerMessage {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub metadata: MessageMetadata,
}

impl From<crate::envelope::MessageEnvelope> for HandlerMessage {
    fn from(envelope: crate::envelope::MessageEnvelope) -> Self {
        Self {
            message_id: envelope.message_id,
            message_type: envelope.message_type,
            payload: envelope.payload,
            retry_count: envelope.retry_count,
            metadata: envelope.metadata,
        }
    }
}

/// A handler's reported failure. Returning `Err` requeues (with backoff) or
/// dead-letters once `max_retries` is exhausted; it never panics the worker.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub reason: String,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
}

impl HandlerFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            exception_type: None,
            exception_message: None,
        }
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for HandlerFailure {}

/// Processes one checked-out message. `cancellation` fires if the dispatcher
/// is scaling this worker down or shutting down; long-running handlers
/// should poll it at natural suspension points.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: HandlerMessage,
        cancellation: CancellationToken,
    ) -> std::result::Result<(), HandlerFailure>;
}

/// Constructs a [`MessageHandler`] instance per checkout. Hosts with
/// stateless handlers can return a clone of one `Arc`; hosts that need
/// per-message scope construct fresh state here.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    async fn create(&self) -> Arc<dyn MessageHandler>;
}

/// Adapts a single shared, stateless handler into a [`HandlerFactory`].
pub struct SharedHandlerFactory<H> {
    handler: Arc<H>,
}

impl<H> SharedHandlerFactory<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl<H: MessageHandler + 'static> HandlerFactory for SharedHandlerFactory<H> {
    async fn create(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }
}
