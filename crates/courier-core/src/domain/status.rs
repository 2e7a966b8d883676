//! Status capability - 処理状態とリトライ情報
//!
//! Items that opt into status tracking carry a `StatusFields` value. Only those
//! items can be rescheduled (retry bookkeeping needs somewhere to live) and only
//! those can sit in a partitioned table, where completion is a status flip
//! instead of a delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of an outbox row.
///
/// Stored as an `int4` column. The discriminants are part of the table format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i32)]
pub enum OutboxItemStatus {
    #[default]
    Ready = 0,
    Failed = 1,
    Retry = 2,
    Completed = 3,
}

impl OutboxItemStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ready),
            1 => Some(Self::Failed),
            2 => Some(Self::Retry),
            3 => Some(Self::Completed),
            _ => None,
        }
    }
}

/// The columns behind the status capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFields {
    pub status: OutboxItemStatus,
    pub retry_count: Option<i32>,
    pub retry_after: Option<DateTime<Utc>>,
}

impl StatusFields {
    pub fn ready() -> Self {
        Self::default()
    }

    /// `retry_after` が未設定か、`now` 以前なら取得対象
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.is_none_or(|after| after <= now)
    }

    /// Records one more failed attempt and when the row becomes eligible again.
    ///
    /// Returns the new retry count.
    pub fn schedule_retry(&mut self, retry_after: DateTime<Utc>) -> i32 {
        let count = self.retry_count.unwrap_or(0).saturating_add(1);
        self.status = OutboxItemStatus::Retry;
        self.retry_count = Some(count);
        self.retry_after = Some(retry_after);
        count
    }

    pub fn mark_completed(&mut self) {
        self.status = OutboxItemStatus::Completed;
    }

    /// Puts the row back in the queue. The retry count is kept.
    pub fn restart(&mut self) {
        self.status = OutboxItemStatus::Ready;
        self.retry_after = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn status_discriminants_match_column_values() {
        assert_eq!(OutboxItemStatus::Ready.as_i32(), 0);
        assert_eq!(OutboxItemStatus::Failed.as_i32(), 1);
        assert_eq!(OutboxItemStatus::Retry.as_i32(), 2);
        assert_eq!(OutboxItemStatus::Completed.as_i32(), 3);
        assert_eq!(OutboxItemStatus::from_i32(2), Some(OutboxItemStatus::Retry));
        assert_eq!(OutboxItemStatus::from_i32(9), None);
    }

    #[test]
    fn schedule_retry_increments_by_one() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut fields = StatusFields::ready();

        assert_eq!(fields.schedule_retry(now + Duration::seconds(2)), 1);
        assert_eq!(fields.schedule_retry(now + Duration::seconds(4)), 2);

        assert_eq!(fields.status, OutboxItemStatus::Retry);
        assert_eq!(fields.retry_count, Some(2));
        assert_eq!(fields.retry_after, Some(now + Duration::seconds(4)));
    }

    #[test]
    fn due_only_after_retry_after() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut fields = StatusFields::ready();
        assert!(fields.is_due(now));

        fields.schedule_retry(now + Duration::seconds(10));
        assert!(!fields.is_due(now));
        assert!(!fields.is_due(now + Duration::seconds(9)));
        assert!(fields.is_due(now + Duration::seconds(10)));
    }

    #[test]
    fn restart_keeps_retry_count() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut fields = StatusFields::ready();
        fields.schedule_retry(now);
        fields.schedule_retry(now);

        fields.restart();

        assert_eq!(fields.status, OutboxItemStatus::Ready);
        assert_eq!(fields.retry_count, Some(2));
        assert_eq!(fields.retry_after, None);
    }
}
