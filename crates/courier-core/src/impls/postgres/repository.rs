//! PostgreSQL repository: one transaction per tick.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{FromRow, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::mapping::{self, DbMapping};
use crate::domain::{ItemFeatures, OutboxError, OutboxItem, OutboxResult, StatusFields};
use crate::ports::{Clock, OutboxRepository, RepositoryMode, RepositoryProvider, SystemClock};

/// `lock_not_available`, raised by `NOWAIT`.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Reads the status columns under their default names, so an item type can
/// `#[sqlx(flatten)]` its `StatusFields`.
impl<'r> FromRow<'r, PgRow> for StatusFields {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            retry_after: row.try_get("retry_after")?,
        })
    }
}

pub(crate) fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Opens a `PgRepository` per tick on a shared pool.
pub struct PgRepositoryProvider<T> {
    pool: PgPool,
    mapping: Arc<DbMapping>,
    clock: Arc<dyn Clock>,
    _item: PhantomData<fn() -> T>,
}

impl<T> PgRepositoryProvider<T> {
    pub fn new(pool: PgPool, mapping: DbMapping) -> Self {
        Self {
            pool,
            mapping: Arc::new(mapping),
            clock: Arc::new(SystemClock),
            _item: PhantomData,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mapping(&self) -> &DbMapping {
        &self.mapping
    }
}

impl<T> RepositoryProvider<T> for PgRepositoryProvider<T>
where
    T: OutboxItem + for<'r> FromRow<'r, PgRow> + Unpin,
{
    fn open(&self, mode: RepositoryMode) -> Box<dyn OutboxRepository<T>> {
        Box::new(PgRepository::<T> {
            pool: self.pool.clone(),
            mapping: Arc::clone(&self.mapping),
            clock: Arc::clone(&self.clock),
            features: ItemFeatures::of::<T>(),
            mode,
            tx: None,
            _item: PhantomData,
        })
    }
}

/// Holds the open transaction between `lock_and_fetch` and `save`.
///
/// Drop した時点で sqlx がロールバックする。
pub struct PgRepository<T> {
    pool: PgPool,
    mapping: Arc<DbMapping>,
    clock: Arc<dyn Clock>,
    features: ItemFeatures,
    mode: RepositoryMode,
    tx: Option<Transaction<'static, Postgres>>,
    _item: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> OutboxRepository<T> for PgRepository<T>
where
    T: OutboxItem + for<'r> FromRow<'r, PgRow> + Unpin,
{
    async fn lock_and_fetch(&mut self, limit: usize) -> OutboxResult<Vec<T>> {
        if self.tx.is_some() {
            return Err(OutboxError::TransactionAlreadyOpen);
        }

        let mut tx = self.pool.begin().await?;
        let sql = mapping::fetch_query(&self.mapping, self.features, self.mode);
        let mut query = sqlx::query_as::<_, T>(&sql);
        if self.features.status {
            query = query.bind(self.clock.now());
        }
        let fetched = query.bind(to_i64(limit)).fetch_all(&mut *tx).await;

        match fetched {
            Ok(items) => {
                self.tx = Some(tx);
                Ok(items)
            }
            Err(err) if is_lock_not_available(&err) => {
                debug!(table = %self.mapping.table, "rows locked by another worker");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&mut self, completed: &[T], retried: &[T]) -> OutboxResult<()> {
        let Some(mut tx) = self.tx.take() else {
            return Err(OutboxError::TransactionNotOpen);
        };
        if !retried.is_empty() && !self.mode.discipline.supports_retry() {
            return Err(OutboxError::RetryNotSupported);
        }

        if !completed.is_empty() {
            let ids: Vec<Uuid> = completed.iter().map(|item| item.id().as_uuid()).collect();
            let sql = if self.mode.partitioned && self.features.status {
                mapping::complete_query(&self.mapping)
            } else {
                mapping::delete_query(&self.mapping)
            };
            sqlx::query(&sql).bind(ids).execute(&mut *tx).await?;
        }

        let rows: Vec<(Uuid, &StatusFields)> = retried
            .iter()
            .filter_map(|item| item.status().map(|fields| (item.id().as_uuid(), fields)))
            .collect();
        if !rows.is_empty() {
            let mut ids = Vec::with_capacity(rows.len());
            let mut statuses = Vec::with_capacity(rows.len());
            let mut counts = Vec::with_capacity(rows.len());
            let mut afters = Vec::with_capacity(rows.len());
            for (id, fields) in rows {
                ids.push(id);
                statuses.push(fields.status.as_i32());
                counts.push(fields.retry_count);
                afters.push(fields.retry_after);
            }
            sqlx::query(&mapping::retry_update_query(&self.mapping))
                .bind(ids)
                .bind(statuses)
                .bind(counts)
                .bind(afters)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
