//! Outbox item identifiers.
//!
//! `ItemId` は ULID (Universally Unique Lexicographically Sortable Identifier) を包む。
//!
//! ## Why ULID
//! - **時刻でソート可能**: the 48-bit millisecond prefix makes id order equal
//!   insertion-time order, so `ORDER BY id` is a FIFO.
//! - **パーティションキー**: the same prefix is the range-partition key. The
//!   lowest id of a day is the ULID with that day's timestamp and zero entropy.
//! - **UUID 互換**: 128-bit, stored in a PostgreSQL `uuid` column byte for byte,
//!   and `uuid` ordering matches ULID ordering.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;
use uuid::Uuid;

/// Identifier of an outbox item.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Ulid);

impl ItemId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(Ulid::from_bytes(*uuid.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0.to_bytes())
    }

    /// Smallest id whose time component is `at`.
    ///
    /// Every id generated at or after `at` sorts at or above this value, which is
    /// what a range partition bound needs.
    pub fn range_start(at: DateTime<Utc>) -> Self {
        let millis = u64::try_from(at.timestamp_millis()).unwrap_or(0);
        Self(Ulid::from_parts(millis, 0))
    }

    /// The time component (creation time) of this id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl From<Ulid> for ItemId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl From<Uuid> for ItemId {
    fn from(uuid: Uuid) -> Self {
        Self::from_uuid(uuid)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ========================================
// PostgreSQL `uuid` column codec
// ========================================

impl sqlx::Type<sqlx::Postgres> for ItemId {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <Uuid as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for ItemId {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <Uuid as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_uuid(), buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for ItemId {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
        Ok(Self::from_uuid(uuid))
    }
}
