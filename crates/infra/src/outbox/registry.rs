//! Delivery handlers, keyed by message kind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::message::OutboxKind;

/// Why a single message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no delivery handler for kind {0}")]
    UnsupportedKind(OutboxKind),

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("receiver rejected delivery with status {status}")]
    Rejected { status: u16 },
}

/// Delivers one message payload to its external sink.
///
/// Delivery is at-least-once: receivers must tolerate duplicates.
#[async_trait]
pub trait KindHandler: Send + Sync {
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError>;
}

/// Maps a message kind to its handler.
pub trait HandlerRegistry: Send + Sync {
    fn resolve(&self, kind: OutboxKind) -> Result<Arc<dyn KindHandler>, DeliveryError>;
}

impl<R: HandlerRegistry + ?Sized> HandlerRegistry for Arc<R> {
    fn resolve(&self, kind: OutboxKind) -> Result<Arc<dyn KindHandler>, DeliveryError> {
        (**self).resolve(kind)
    }
}

/// Table-driven [`HandlerRegistry`]. Adding a kind is one registration.
#[derive(Default, Clone)]
pub struct KindRegistry {
    handlers: HashMap<OutboxKind, Arc<dyn KindHandler>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(&mut self, kind: OutboxKind, handler: Arc<dyn KindHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Register an async closure as the handler for `kind`.
    pub fn register_fn<F, Fut>(&mut self, kind: OutboxKind, f: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler(f)));
    }

    pub fn with_handler(mut self, kind: OutboxKind, handler: Arc<dyn KindHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn contains(&self, kind: OutboxKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds, in their integer order.
    pub fn kinds(&self) -> Vec<OutboxKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_i32());
        kinds
    }
}

impl std::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry for KindRegistry {
    fn resolve(&self, kind: OutboxKind) -> Result<Arc<dyn KindHandler>, DeliveryError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(DeliveryError::UnsupportedKind(kind))
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> KindHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
{
    async fn deliver(&self, payload: &[u8]) -> Result<(), DeliveryError> {
        (self.0)(payload.to_vec()).await
    }
}
