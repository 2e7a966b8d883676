//! PostgreSQL partition DDL.
//!
//! DDL は bind できないので、識別子は quote して境界値は UUID リテラルで埋め込む。
//! `DETACH … CONCURRENTLY` cannot run inside a transaction block, so every
//! statement goes straight to the pool in autocommit.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::debug;

use super::mapping::DbMapping;
use crate::ports::{PartitionError, PartitionRange, PartitionStore};

const UNDEFINED_TABLE: &str = "42P01";
const WRONG_OBJECT_TYPE: &str = "42809";

pub struct PgPartitionStore {
    pool: PgPool,
    mapping: Arc<DbMapping>,
}

impl PgPartitionStore {
    pub fn new(pool: PgPool, mapping: DbMapping) -> Self {
        Self {
            pool,
            mapping: Arc::new(mapping),
        }
    }

    async fn run(&self, sql: &str, partition: &str) -> Result<(), PartitionError> {
        debug!(sql, "partition ddl");
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, &self.mapping.table, partition))
    }
}

pub(crate) fn create_partition_sql(mapping: &DbMapping, range: &PartitionRange) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
        mapping.qualified(&range.name),
        mapping.qualified_table(),
        range.from.as_uuid(),
        range.to.as_uuid()
    )
}

pub(crate) fn detach_partition_sql(mapping: &DbMapping, name: &str) -> String {
    format!(
        "ALTER TABLE {} DETACH PARTITION {} CONCURRENTLY",
        mapping.qualified_table(),
        mapping.qualified(name)
    )
}

pub(crate) fn drop_partition_sql(mapping: &DbMapping, name: &str) -> String {
    format!("DROP TABLE {}", mapping.qualified(name))
}

/// Maps a DDL failure onto what the partition manager acts on.
pub(crate) fn classify_message(
    code: Option<&str>,
    message: &str,
    table: &str,
    partition: &str,
) -> PartitionError {
    if message.contains("is not partitioned") {
        return PartitionError::NotPartitioned(table.to_string());
    }
    if message.contains("is not a partition of") || message.contains("does not exist") {
        return PartitionError::NotFound(partition.to_string());
    }
    match code {
        Some(UNDEFINED_TABLE) => PartitionError::NotFound(partition.to_string()),
        Some(WRONG_OBJECT_TYPE) => PartitionError::NotPartitioned(table.to_string()),
        _ => PartitionError::Other(message.to_string()),
    }
}

fn classify(err: sqlx::Error, table: &str, partition: &str) -> PartitionError {
    match err.as_database_error() {
        Some(db) => classify_message(db.code().as_deref(), db.message(), table, partition),
        None => PartitionError::Other(err.to_string()),
    }
}

#[async_trait]
impl PartitionStore for PgPartitionStore {
    fn table(&self) -> &str {
        &self.mapping.table
    }

    async fn create_if_not_exists(&self, range: &PartitionRange) -> Result<(), PartitionError> {
        self.run(&create_partition_sql(&self.mapping, range), &range.name)
            .await
    }

    async fn detach_concurrently(&self, name: &str) -> Result<(), PartitionError> {
        self.run(&detach_partition_sql(&self.mapping, name), name)
            .await
    }

    async fn drop_partition(&self, name: &str) -> Result<(), PartitionError> {
        self.run(&drop_partition_sql(&self.mapping, name), name).await
    }
}
