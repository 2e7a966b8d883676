//! PostgreSQL maintenance repository - 運用向けの参照・削除・再実行

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::FromRow;
use uuid::Uuid;

use super::mapping::{self, DbMapping};
use crate::domain::{ItemId, OutboxItem, OutboxResult};
use crate::ports::MaintenanceRepository;

/// Operator access to one outbox table. No row locks are taken.
pub struct PgMaintenanceRepository<T> {
    pool: PgPool,
    mapping: Arc<DbMapping>,
    _item: PhantomData<fn() -> T>,
}

impl<T> PgMaintenanceRepository<T> {
    pub fn new(pool: PgPool, mapping: DbMapping) -> Self {
        Self {
            pool,
            mapping: Arc::new(mapping),
            _item: PhantomData,
        }
    }
}

fn uuids(ids: &[ItemId]) -> Vec<Uuid> {
    ids.iter().map(ItemId::as_uuid).collect()
}

#[async_trait]
impl<T> MaintenanceRepository<T> for PgMaintenanceRepository<T>
where
    T: OutboxItem + for<'r> FromRow<'r, PgRow> + Unpin,
{
    async fn chunk(&self, skip: usize, take: usize) -> OutboxResult<Vec<T>> {
        let sql = mapping::chunk_query(&self.mapping);
        let items = sqlx::query_as::<_, T>(&sql)
            .bind(i64::try_from(take).unwrap_or(i64::MAX))
            .bind(i64::try_from(skip).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn clear(&self) -> OutboxResult<()> {
        let sql = format!("TRUNCATE {}", self.mapping.qualified_table());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[ItemId]) -> OutboxResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&mapping::delete_query(&self.mapping))
            .bind(uuids(ids))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn restart(&self, ids: &[ItemId]) -> OutboxResult<u64> {
        // no status columns, nothing to reset
        if !T::HAS_STATUS || ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&mapping::restart_query(&self.mapping))
            .bind(uuids(ids))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
