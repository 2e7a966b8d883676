//! Repository port - 行ロック付きの取得と保存
//!
//! One `OutboxRepository` is one unit of work:
//! `lock_and_fetch` opens a transaction and locks the returned rows,
//! `save` writes every outcome and commits. Dropping the repository without
//! `save` rolls the transaction back and releases the locks. This is the only
//! cleanup path, so an early return, a `?` or a cancelled future all leave
//! the table as it was.

use async_trait::async_trait;

use crate::domain::{OutboxItem, OutboxResult};

/// Row-lock discipline of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDiscipline {
    /// `FOR UPDATE SKIP LOCKED`: rows locked elsewhere are left out.
    SkipLocked,
    /// `FOR UPDATE NOWAIT`: any conflict yields an empty batch.
    NoWait,
}

impl LockDiscipline {
    /// Whether `save` accepts retried items.
    pub fn supports_retry(self) -> bool {
        matches!(self, Self::SkipLocked)
    }
}

/// Transactional fetch-and-lock / save of one outbox table.
#[async_trait]
pub trait OutboxRepository<T: OutboxItem>: Send {
    /// Opens a transaction and locks up to `limit` eligible rows.
    ///
    /// Eligible: `retry_after` is null or not in the future, and, for a
    /// partitioned table, not yet `Completed`. Rows come back in
    /// `(priority desc, id asc, retry_after asc)` order.
    async fn lock_and_fetch(&mut self, limit: usize) -> OutboxResult<Vec<T>>;

    /// Removes (or marks `Completed`) `completed`, writes the status fields of
    /// `retried`, then commits.
    async fn save(&mut self, completed: &[T], retried: &[T]) -> OutboxResult<()>;
}

/// How a repository fetches and saves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryMode {
    pub discipline: LockDiscipline,
    /// Completed rows are stamped `Completed` instead of deleted, and never
    /// fetched again. Their partition is dropped later.
    pub partitioned: bool,
}

impl RepositoryMode {
    pub fn new(discipline: LockDiscipline, partitioned: bool) -> Self {
        Self {
            discipline,
            partitioned,
        }
    }
}

/// Opens one repository per tick.
pub trait RepositoryProvider<T: OutboxItem>: Send + Sync {
    fn open(&self, mode: RepositoryMode) -> Box<dyn OutboxRepository<T>>;
}
