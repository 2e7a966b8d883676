//! Handler port - 呼び出し側が実装する処理
//!
//! Handlers run while the row locks are held, so their latency is lock-hold
//! time. A fresh handler is created per item (single workers) or per batch
//! (batch workers) through the factory traits; no state is shared between
//! calls.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::options::OutboxOptions;
use crate::domain::{BatchResult, HandleResult, HandlerError, OutboxItem};

/// Handles one item. An `Err` is treated as `HandleResult::Retry`.
#[async_trait]
pub trait ItemHandler<T: OutboxItem>: Send + Sync {
    async fn handle(
        &self,
        item: &T,
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> Result<HandleResult, HandlerError>;
}

/// Handles a whole batch. An `Err` fails every item of the batch.
#[async_trait]
pub trait BatchHandler<T: OutboxItem>: Send + Sync {
    async fn handle(
        &self,
        items: &[T],
        options: &OutboxOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, HandlerError>;
}

pub trait ItemHandlerFactory<T: OutboxItem>: Send + Sync {
    fn create(&self) -> Box<dyn ItemHandler<T>>;
}

pub trait BatchHandlerFactory<T: OutboxItem>: Send + Sync {
    fn create(&self) -> Box<dyn BatchHandler<T>>;
}

impl<T, F, H> ItemHandlerFactory<T> for F
where
    T: OutboxItem,
    F: Fn() -> H + Send + Sync,
    H: ItemHandler<T> + 'static,
{
    fn create(&self) -> Box<dyn ItemHandler<T>> {
        Box::new(self())
    }
}

impl<T, F, H> BatchHandlerFactory<T> for F
where
    T: OutboxItem,
    F: Fn() -> H + Send + Sync,
    H: BatchHandler<T> + 'static,
{
    fn create(&self) -> Box<dyn BatchHandler<T>> {
        Box::new(self())
    }
}

/// The handler registered for an outbox.
pub enum HandlerKind<T: OutboxItem> {
    Item(Arc<dyn ItemHandlerFactory<T>>),
    Batch(Arc<dyn BatchHandlerFactory<T>>),
}

impl<T: OutboxItem> HandlerKind<T> {
    pub fn item(factory: impl ItemHandlerFactory<T> + 'static) -> Self {
        Self::Item(Arc::new(factory))
    }

    pub fn batch(factory: impl BatchHandlerFactory<T> + 'static) -> Self {
        Self::Batch(Arc::new(factory))
    }
}

impl<T: OutboxItem> Clone for HandlerKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Item(f) => Self::Item(Arc::clone(f)),
            Self::Batch(f) => Self::Batch(Arc::clone(f)),
        }
    }
}
