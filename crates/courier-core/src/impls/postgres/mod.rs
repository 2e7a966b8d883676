//! PostgreSQL backend
//!
//! - `PgRepositoryProvider`: `FOR UPDATE SKIP LOCKED` / `NOWAIT` でロックして取得、
//!   1 トランザクションで保存
//! - `PgPartitionStore`: 日付範囲パーティションの DDL
//! - `PgMaintenanceRepository`: 運用向けの参照・再実行
//!
//! Item types are read with `sqlx::FromRow`; the column names used in SQL come
//! from `DbMapping`.

pub mod maintenance;
pub mod mapping;
pub mod partitions;
pub mod repository;

pub use self::maintenance::PgMaintenanceRepository;
pub use self::mapping::DbMapping;
pub use self::partitions::PgPartitionStore;
pub use self::repository::{PgRepository, PgRepositoryProvider};
