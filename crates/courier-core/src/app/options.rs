//! Options - アウトボックス単位の設定
//!
//! Everything a registration needs, as one typed value. Deserialises from JSON
//! with every field optional; durations are written in milliseconds.
//!
//! ```json
//! {
//!   "worker_type": "BatchCompeting",
//!   "outbox_items_limit": 50,
//!   "worker_delay": 1000,
//!   "retry": { "delay_policy": "Linear", "retry_delay": 500 },
//!   "partitions": { "enabled": true, "days_per_partition": 2 }
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{OutboxError, OutboxResult};
use crate::ports::LockDiscipline;

/// Upper bound of `worker_delay`.
pub const MAX_WORKER_DELAY: Duration = Duration::from_secs(60 * 60);

/// Upper bound of `partitions.days_per_partition` (about ten years).
pub const MAX_DAYS_PER_PARTITION: u32 = 3650;

/// Upper bound of the partition counts.
pub const MAX_PARTITION_COUNT: u32 = 1000;

/// Worker strategy of an outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    #[default]
    Competing,
    StrictOrdering,
    BatchCompeting,
    BatchStrictOrdering,
}

impl WorkerType {
    pub const ALL: [WorkerType; 4] = [
        Self::Competing,
        Self::StrictOrdering,
        Self::BatchCompeting,
        Self::BatchStrictOrdering,
    ];

    pub fn lock_discipline(self) -> LockDiscipline {
        match self {
            Self::Competing | Self::BatchCompeting => LockDiscipline::SkipLocked,
            Self::StrictOrdering | Self::BatchStrictOrdering => LockDiscipline::NoWait,
        }
    }

    pub fn is_batch(self) -> bool {
        matches!(self, Self::BatchCompeting | Self::BatchStrictOrdering)
    }

    /// Competing workers reschedule failures, which needs the status capability.
    pub fn requires_status(self) -> bool {
        self.lock_discipline() == LockDiscipline::SkipLocked
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Competing => "Competing",
            Self::StrictOrdering => "StrictOrdering",
            Self::BatchCompeting => "BatchCompeting",
            Self::BatchStrictOrdering => "BatchStrictOrdering",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    /// Accepts `StrictOrdering`, `strict-ordering`, `strict_ordering`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().to_lowercase() == normalized)
            .ok_or_else(|| format!("unknown worker type `{s}`"))
    }
}

/// How the retry delay grows with the attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayPolicy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub is_enabled: bool,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    pub delay_policy: DelayPolicy,
    pub log_on_retry: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            is_enabled: true,
            retry_delay: Duration::from_secs(3),
            retry_max_delay: Duration::from_secs(10),
            delay_policy: DelayPolicy::Exponential,
            log_on_retry: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub enabled: bool,
    pub days_per_partition: u32,
    pub precreate_partition_count: u32,
    pub partition_retention_count: u32,
    #[serde(with = "duration_ms")]
    pub precreate_partition_period: Duration,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            days_per_partition: 1,
            precreate_partition_count: 7,
            partition_retention_count: 3,
            precreate_partition_period: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxOptions {
    pub worker_type: WorkerType,
    pub outbox_items_limit: usize,
    #[serde(with = "duration_ms")]
    pub worker_delay: Duration,
    pub is_worker_enabled: bool,
    pub retry: RetrySettings,
    pub partitions: PartitionSettings,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            worker_type: WorkerType::Competing,
            outbox_items_limit: 100,
            worker_delay: Duration::from_secs(5),
            is_worker_enabled: true,
            retry: RetrySettings::default(),
            partitions: PartitionSettings::default(),
        }
    }
}

impl OutboxOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Value checks that do not depend on the item type.
    pub fn validate(&self, outbox: &str) -> OutboxResult<()> {
        let invalid = |reason: &str| {
            Err(OutboxError::InvalidConfiguration {
                outbox: outbox.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.outbox_items_limit == 0 {
            return invalid("outbox_items_limit must be greater than zero");
        }
        if self.worker_delay > MAX_WORKER_DELAY {
            return invalid("worker_delay must be at most one hour");
        }
        if self.retry.retry_max_delay.is_zero() {
            return invalid("retry.retry_max_delay must be greater than zero");
        }

        let partitions = &self.partitions;
        if partitions.enabled {
            if partitions.days_per_partition == 0 {
                return invalid("partitions.days_per_partition must be at least 1");
            }
            if partitions.precreate_partition_count == 0 {
                return invalid("partitions.precreate_partition_count must be at least 1");
            }
            if partitions.partition_retention_count == 0 {
                return invalid("partitions.partition_retention_count must be at least 1");
            }
            if partitions.days_per_partition > MAX_DAYS_PER_PARTITION {
                return invalid("partitions.days_per_partition must be at most 3650");
            }
            if partitions.precreate_partition_count > MAX_PARTITION_COUNT
                || partitions.partition_retention_count > MAX_PARTITION_COUNT
            {
                return invalid("partition counts must be at most 1000");
            }
            if partitions.precreate_partition_period.is_zero() {
                return invalid("partitions.precreate_partition_period must be greater than zero");
            }
        }
        Ok(())
    }
}

/// `Duration` <-> integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
