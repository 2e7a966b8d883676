//! OutboxItem - アウトボックス行の抽象
//!
//! An outbox item is an opaque payload with a required `ItemId`. Status tracking
//! and priority are optional capabilities. A type opts in by setting the
//! associated const and overriding the matching accessors, so the capability
//! set is a property of the type and can be read once at registration.

use super::ids::ItemId;
use super::status::StatusFields;

/// A row of an outbox table.
///
/// # Capabilities
/// - `HAS_STATUS`: `status()` / `status_mut()` return `Some`
/// - `HAS_PRIORITY`: `priority()` returns `Some`; higher values are fetched first
///
/// The defaults describe an item with neither capability.
pub trait OutboxItem: Clone + Send + Sync + 'static {
    const HAS_STATUS: bool = false;
    const HAS_PRIORITY: bool = false;

    fn id(&self) -> ItemId;

    fn status(&self) -> Option<&StatusFields> {
        None
    }

    fn status_mut(&mut self) -> Option<&mut StatusFields> {
        None
    }

    fn priority(&self) -> Option<i32> {
        None
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Item types shared by the tests of the worker, repository and builder modules.

    use super::*;
    use chrono::{DateTime, Utc};
    use ulid::Ulid;

    /// Status + priority tracking item.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Message {
        pub id: ItemId,
        pub payload: String,
        pub priority: i32,
        pub fields: StatusFields,
    }

    impl Message {
        pub fn new(seq: u64, payload: &str) -> Self {
            Self::at(1_700_000_000_000 + seq, payload)
        }

        pub fn at(millis: u64, payload: &str) -> Self {
            Self {
                id: ItemId::from_ulid(Ulid::from_parts(millis, 1)),
                payload: payload.to_string(),
                priority: 0,
                fields: StatusFields::ready(),
            }
        }

        pub fn with_priority(mut self, priority: i32) -> Self {
            self.priority = priority;
            self
        }

        pub fn retry_after(mut self, at: DateTime<Utc>) -> Self {
            self.fields.retry_after = Some(at);
            self
        }
    }

    impl OutboxItem for Message {
        const HAS_STATUS: bool = true;
        const HAS_PRIORITY: bool = true;

        fn id(&self) -> ItemId {
            self.id
        }

        fn status(&self) -> Option<&StatusFields> {
            Some(&self.fields)
        }

        fn status_mut(&mut self) -> Option<&mut StatusFields> {
            Some(&mut self.fields)
        }

        fn priority(&self) -> Option<i32> {
            Some(self.priority)
        }
    }

    /// Payload-only item, no capabilities.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Plain {
        pub id: ItemId,
        pub payload: String,
    }

    impl Plain {
        pub fn new(seq: u64, payload: &str) -> Self {
            Self {
                id: ItemId::from_ulid(Ulid::from_parts(1_700_000_000_000 + seq, 1)),
                payload: payload.to_string(),
            }
        }
    }

    impl OutboxItem for Plain {
        fn id(&self) -> ItemId {
            self.id
        }
    }
}
