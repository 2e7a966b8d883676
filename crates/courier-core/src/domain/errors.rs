//! Errors - エラー型と分類
//!
//! | 分類 | 扱い |
//! |---|---|
//! | NOWAIT lock contention | not an error, empty batch |
//! | handler failure | retry bookkeeping, never surfaces as `OutboxError` |
//! | tick failure (`Database`, `Transaction*`) | logged at the worker boundary, rolled back |
//! | `PartitioningNotConfigured` | setup error, logged and returned |
//! | `InvalidConfiguration`, `MissingHandler`, `StatusNotSupported` | fail-fast at build time |

/// Error a handler may return. Treated exactly like `HandleResult::Retry`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no open transaction; lock_and_fetch must run before save")]
    TransactionNotOpen,

    #[error("a transaction is already open on this repository")]
    TransactionAlreadyOpen,

    #[error("strict-ordering repositories cannot save retried items")]
    RetryNotSupported,

    #[error("item type of outbox `{0}` does not track status")]
    StatusNotSupported(String),

    #[error("table `{0}` is not partitioned but partitioning is enabled")]
    PartitioningNotConfigured(String),

    #[error("partition `{partition}` maintenance failed: {reason}")]
    Partition { partition: String, reason: String },

    #[error("invalid configuration for outbox `{outbox}`: {reason}")]
    InvalidConfiguration { outbox: String, reason: String },

    #[error("outbox `{outbox}` has no {expected} handler registered")]
    MissingHandler {
        outbox: String,
        expected: &'static str,
    },
}

impl OutboxError {
    /// A setup problem that will not go away by retrying.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::PartitioningNotConfigured(_)
                | Self::InvalidConfiguration { .. }
                | Self::MissingHandler { .. }
                | Self::StatusNotSupported(_)
        )
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
