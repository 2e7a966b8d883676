//! PartitionStore port - パーティションの DDL
//!
//! The partition manager computes names and bounds; the store only runs DDL
//! and classifies what went wrong.

use async_trait::async_trait;

use crate::domain::ItemId;

/// One time range of the parent table, `[from, to)` on the id column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub name: String,
    pub from: ItemId,
    pub to: ItemId,
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// The parent table exists but is not partitioned.
    #[error("table is not partitioned: {0}")]
    NotPartitioned(String),

    /// The partition is already gone (a concurrent run got there first).
    #[error("partition does not exist: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Parent table name, used in logs and errors.
    fn table(&self) -> &str;

    /// `CREATE TABLE IF NOT EXISTS … PARTITION OF …`.
    async fn create_if_not_exists(&self, range: &PartitionRange) -> Result<(), PartitionError>;

    /// `ALTER TABLE … DETACH PARTITION … CONCURRENTLY`.
    async fn detach_concurrently(&self, name: &str) -> Result<(), PartitionError>;

    async fn drop_partition(&self, name: &str) -> Result<(), PartitionError>;
}
