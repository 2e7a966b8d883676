//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（PostgreSQL, 呼び出し側の handler）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - データベースの行ロックが唯一の排他制御（プロセス内の調整はしない）
//! - 1 tick = 1 repository = 1 transaction

pub mod clock;
pub mod handler;
pub mod id_generator;
pub mod maintenance;
pub mod partition_store;
pub mod repository;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::handler::{
    BatchHandler, BatchHandlerFactory, HandlerKind, ItemHandler, ItemHandlerFactory,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::maintenance::MaintenanceRepository;
pub use self::partition_store::{PartitionError, PartitionRange, PartitionStore};
pub use self::repository::{
    LockDiscipline, OutboxRepository, RepositoryMode, RepositoryProvider,
};
