//! Impls - ports の実装
//!
//! - **memory**: プロセス内のテーブル。テスト・デモ用
//! - **postgres**: 本番用

pub mod memory;
pub mod postgres;

pub use self::memory::{InMemoryOutbox, InMemoryPartitionStore, InMemoryRepository};
pub use self::postgres::{
    DbMapping, PgMaintenanceRepository, PgPartitionStore, PgRepositoryProvider,
};
