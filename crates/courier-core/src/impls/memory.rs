//! In-memory outbox table.
//!
//! Emulates the PostgreSQL behaviour the workers depend on:
//! - row locks owned by a transaction, released on commit or drop
//! - `SKIP LOCKED`: rows locked by another transaction are left out
//! - `NOWAIT`: a scan that reaches a row locked elsewhere fails, which the
//!   repository turns into an empty batch
//!
//! Writes only happen in `save`, so dropping a repository is a rollback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{
    ItemFeatures, ItemId, OutboxError, OutboxItem, OutboxItemStatus, OutboxResult,
};
use crate::ports::{
    Clock, LockDiscipline, MaintenanceRepository, OutboxRepository, PartitionError,
    PartitionRange, PartitionStore, RepositoryMode, RepositoryProvider, SystemClock,
};

type TxnId = u64;

/// Table state.
struct TableState<T> {
    /// Rows by id (single source of truth).
    rows: BTreeMap<ItemId, T>,

    /// Row locks: id -> owning transaction.
    locks: HashMap<ItemId, TxnId>,

    next_txn: TxnId,
}

impl<T: OutboxItem> TableState<T> {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            locks: HashMap::new(),
            next_txn: 1,
        }
    }

    fn begin(&mut self) -> TxnId {
        let txn = self.next_txn;
        self.next_txn += 1;
        txn
    }

    /// Eligible rows in fetch order: priority desc, id asc, retry_after asc.
    fn scan(
        &self,
        features: ItemFeatures,
        now: chrono::DateTime<chrono::Utc>,
        partitioned: bool,
    ) -> Vec<&T> {
        let mut eligible: Vec<&T> = self
            .rows
            .values()
            .filter(|item| match item.status() {
                Some(fields) => {
                    fields.is_due(now)
                        && !(partitioned && fields.status == OutboxItemStatus::Completed)
                }
                None => true,
            })
            .collect();

        if features.priority {
            // stable sort: ties keep id order from the BTreeMap
            eligible.sort_by_key(|item| std::cmp::Reverse(item.priority().unwrap_or(0)));
        }
        eligible
    }

    fn locked_by_other(&self, id: &ItemId, txn: TxnId) -> bool {
        self.locks.get(id).is_some_and(|owner| *owner != txn)
    }

    fn release(&mut self, txn: TxnId) {
        self.locks.retain(|_, owner| *owner != txn);
    }
}

/// In-memory outbox table, shared by every repository it opens.
pub struct InMemoryOutbox<T> {
    state: Arc<Mutex<TableState<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for InMemoryOutbox<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T: OutboxItem> InMemoryOutbox<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState::new())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState<T>> {
        lock_state(&self.state)
    }

    /// Inserts (or replaces) a row, as the owning application would.
    pub fn insert(&self, item: T) {
        self.lock().rows.insert(item.id(), item);
    }

    pub fn insert_many(&self, items: impl IntoIterator<Item = T>) {
        let mut state = self.lock();
        for item in items {
            state.rows.insert(item.id(), item);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &ItemId) -> Option<T> {
        self.lock().rows.get(id).cloned()
    }

    /// Every row, ordered by id.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().rows.values().cloned().collect()
    }

    /// Number of rows currently locked by an open transaction.
    pub fn locked_rows(&self) -> usize {
        self.lock().locks.len()
    }
}

impl<T: OutboxItem> Default for InMemoryOutbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state<T>(state: &Mutex<TableState<T>>) -> MutexGuard<'_, TableState<T>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: OutboxItem> RepositoryProvider<T> for InMemoryOutbox<T> {
    fn open(&self, mode: RepositoryMode) -> Box<dyn OutboxRepository<T>> {
        Box::new(InMemoryRepository {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            features: ItemFeatures::of::<T>(),
            mode,
            txn: None,
        })
    }
}

/// One unit of work against an `InMemoryOutbox`.
pub struct InMemoryRepository<T: OutboxItem> {
    state: Arc<Mutex<TableState<T>>>,
    clock: Arc<dyn Clock>,
    features: ItemFeatures,
    mode: RepositoryMode,
    txn: Option<TxnId>,
}

#[async_trait]
impl<T: OutboxItem> OutboxRepository<T> for InMemoryRepository<T> {
    async fn lock_and_fetch(&mut self, limit: usize) -> OutboxResult<Vec<T>> {
        if self.txn.is_some() {
            return Err(OutboxError::TransactionAlreadyOpen);
        }
        let now = self.clock.now();
        let mut state = lock_state(&self.state);
        let txn = state.begin();

        let selected: Vec<T> = {
            let candidates = state.scan(self.features, now, self.mode.partitioned);
            match self.mode.discipline {
                LockDiscipline::SkipLocked => candidates
                    .into_iter()
                    .filter(|item| !state.locked_by_other(&item.id(), txn))
                    .take(limit)
                    .cloned()
                    .collect(),
                LockDiscipline::NoWait => {
                    let window: Vec<&T> = candidates.into_iter().take(limit).collect();
                    if window.iter().any(|item| state.locked_by_other(&item.id(), txn)) {
                        // lock_not_available: the transaction is discarded
                        return Ok(Vec::new());
                    }
                    window.into_iter().cloned().collect()
                }
            }
        };

        for item in &selected {
            state.locks.insert(item.id(), txn);
        }
        self.txn = Some(txn);
        Ok(selected)
    }

    async fn save(&mut self, completed: &[T], retried: &[T]) -> OutboxResult<()> {
        let Some(txn) = self.txn else {
            return Err(OutboxError::TransactionNotOpen);
        };
        if !retried.is_empty() && !self.mode.discipline.supports_retry() {
            return Err(OutboxError::RetryNotSupported);
        }

        let mut state = lock_state(&self.state);
        for item in completed {
            if self.mode.partitioned {
                if let Some(fields) = state.rows.get_mut(&item.id()).and_then(T::status_mut) {
                    fields.mark_completed();
                }
            } else {
                state.rows.remove(&item.id());
            }
        }
        for item in retried {
            if let (Some(row), Some(fields)) = (state.rows.get_mut(&item.id()), item.status())
                && let Some(target) = row.status_mut()
            {
                *target = fields.clone();
            }
        }
        state.release(txn);
        self.txn = None;
        Ok(())
    }
}

impl<T: OutboxItem> Drop for InMemoryRepository<T> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            lock_state(&self.state).release(txn);
        }
    }
}

#[async_trait]
impl<T: OutboxItem> MaintenanceRepository<T> for InMemoryOutbox<T> {
    async fn chunk(&self, skip: usize, take: usize) -> OutboxResult<Vec<T>> {
        Ok(self.lock().rows.values().skip(skip).take(take).cloned().collect())
    }

    async fn clear(&self) -> OutboxResult<()> {
        self.lock().rows.clear();
        Ok(())
    }

    async fn delete(&self, ids: &[ItemId]) -> OutboxResult<u64> {
        let mut state = self.lock();
        let removed = ids.iter().filter(|id| state.rows.remove(id).is_some()).count();
        Ok(removed as u64)
    }

    async fn restart(&self, ids: &[ItemId]) -> OutboxResult<u64> {
        let mut state = self.lock();
        let mut touched = 0;
        for id in ids {
            if let Some(fields) = state.rows.get_mut(id).and_then(T::status_mut) {
                fields.restart();
                touched += 1;
            }
        }
        Ok(touched)
    }
}

// ========================================
// Partition store
// ========================================

#[derive(Default)]
struct PartitionState {
    attached: BTreeMap<String, PartitionRange>,
    detached: BTreeSet<String>,
}

/// In-memory partition catalogue of one parent table.
pub struct InMemoryPartitionStore {
    table: String,
    partitioned: bool,
    state: Mutex<PartitionState>,
}

impl InMemoryPartitionStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partitioned: true,
            state: Mutex::new(PartitionState::default()),
        }
    }

    /// A plain table: every DDL call fails with `NotPartitioned`.
    pub fn unpartitioned(table: impl Into<String>) -> Self {
        Self {
            partitioned: false,
            ..Self::new(table)
        }
    }

    /// Attached partitions, ordered by name.
    pub fn partition_names(&self) -> Vec<String> {
        self.lock().attached.keys().cloned().collect()
    }

    /// Detached but not yet dropped.
    pub fn detached_names(&self) -> Vec<String> {
        self.lock().detached.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_partitioned(&self) -> Result<(), PartitionError> {
        if self.partitioned {
            Ok(())
        } else {
            Err(PartitionError::NotPartitioned(format!(
                "\"{}\" is not partitioned",
                self.table
            )))
        }
    }
}

#[async_trait]
impl PartitionStore for InMemoryPartitionStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn create_if_not_exists(&self, range: &PartitionRange) -> Result<(), PartitionError> {
        self.check_partitioned()?;
        let mut state = self.lock();
        if state.attached.contains_key(&range.name) || state.detached.contains(&range.name) {
            return Ok(());
        }
        if let Some(existing) = state
            .attached
            .values()
            .find(|p| range.from < p.to && p.from < range.to)
        {
            return Err(PartitionError::Other(format!(
                "partition \"{}\" would overlap partition \"{}\"",
                range.name, existing.name
            )));
        }
        state.attached.insert(range.name.clone(), range.clone());
        Ok(())
    }

    async fn detach_concurrently(&self, name: &str) -> Result<(), PartitionError> {
        self.check_partitioned()?;
        let mut state = self.lock();
        if state.attached.remove(name).is_none() {
            return Err(PartitionError::NotFound(name.to_string()));
        }
        state.detached.insert(name.to_string());
        Ok(())
    }

    async fn drop_partition(&self, name: &str) -> Result<(), PartitionError> {
        let mut state = self.lock();
        let was_attached = state.attached.remove(name).is_some();
        let was_detached = state.detached.remove(name);
        if was_attached || was_detached {
            Ok(())
        } else {
            Err(PartitionError::NotFound(name.to_string()))
        }
    }
}
