//! App - アプリケーション層
//!
//! ports を組み合わせてアウトボックスの処理を実装する。
//!
//! # 主要コンポーネント
//! - **OutboxBuilder**: 設定・ハンドラ・バックエンドの検証と組み立て
//! - **worker**: 4 種類のワーカー（competing / strict / batch 版）
//! - **RetryDelayComputer**: 再試行までの待ち時間
//! - **PartitionManager**: パーティションの事前作成と削除
//! - **OutboxScheduler**: 定期実行ループ

pub mod builder;
pub mod metrics;
pub mod options;
pub mod partitions;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use self::builder::{OptionsHandle, OutboxBuilder, OutboxRegistration, ScheduledOutbox};
pub use self::metrics::OutboxMetrics;
pub use self::options::{
    DelayPolicy, OutboxOptions, PartitionSettings, RetrySettings, WorkerType,
};
pub use self::partitions::PartitionManager;
pub use self::retry::RetryDelayComputer;
pub use self::scheduler::OutboxScheduler;
pub use self::worker::{OutboxWorker, WorkerContext};
