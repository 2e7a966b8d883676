//! Maintenance port - 運用向けの参照・操作
//!
//! Used by operators to inspect a stuck outbox and push rows back through the
//! workers. None of these operations lock rows; they are not meant to run in the
//! hot path.

use async_trait::async_trait;

use crate::domain::{ItemId, OutboxItem, OutboxResult};

#[async_trait]
pub trait MaintenanceRepository<T: OutboxItem>: Send + Sync {
    /// A page of rows ordered by id.
    async fn chunk(&self, skip: usize, take: usize) -> OutboxResult<Vec<T>>;

    /// Removes every row.
    async fn clear(&self) -> OutboxResult<()>;

    /// Returns how many rows were deleted.
    async fn delete(&self, ids: &[ItemId]) -> OutboxResult<u64>;

    /// Sets status back to `Ready` and clears `retry_after`.
    ///
    /// `retry_count` is kept. Returns how many rows were touched.
    async fn restart(&self, ids: &[ItemId]) -> OutboxResult<u64>;
}
