//! Capability descriptor, resolved once per item type.

use serde::{Deserialize, Serialize};

use super::item::OutboxItem;

/// Optional capabilities of an item type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFeatures {
    pub status: bool,
    pub priority: bool,
}

impl ItemFeatures {
    pub const fn of<T: OutboxItem>() -> Self {
        Self {
            status: T::HAS_STATUS,
            priority: T::HAS_PRIORITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::fixtures::{Message, Plain};

    #[test]
    fn features_follow_the_item_type() {
        assert_eq!(
            ItemFeatures::of::<Message>(),
            ItemFeatures {
                status: true,
                priority: true
            }
        );
        assert_eq!(ItemFeatures::of::<Plain>(), ItemFeatures::default());
    }
}
