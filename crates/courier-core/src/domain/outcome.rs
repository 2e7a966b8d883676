//! Outcome model: what a handler says about an item, and what a tick did.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// Verdict of an item handler.
///
/// `Skip` removes the item exactly like `Ok`. It does not leave the row in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandleResult {
    Ok,
    Skip,
    Retry,
}

impl HandleResult {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }
}

/// Verdict of a batch handler.
///
/// - `all_processed = true`: every item in the batch succeeded, `outcomes` is ignored
/// - otherwise each item is looked up in `outcomes`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub all_processed: bool,
    pub outcomes: HashMap<ItemId, HandleResult>,
}

impl BatchResult {
    pub fn fully_processed() -> Self {
        Self {
            all_processed: true,
            outcomes: HashMap::new(),
        }
    }

    pub fn partially(outcomes: HashMap<ItemId, HandleResult>) -> Self {
        Self {
            all_processed: false,
            outcomes,
        }
    }

    pub fn outcome(&self, id: &ItemId) -> Option<HandleResult> {
        if self.all_processed {
            return Some(HandleResult::Ok);
        }
        self.outcomes.get(id).copied()
    }
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    /// Nothing eligible, or the window was owned by another worker.
    Empty,
    Completed,
    /// Fetch, handler setup or save failed; the transaction was rolled back.
    Failed,
    /// Cancelled before commit; the transaction was rolled back.
    Cancelled,
}

/// Summary of one worker tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub fetched: usize,
    pub processed: usize,
    pub retried: usize,
    pub status: TickStatus,
}

impl TickReport {
    pub fn empty() -> Self {
        Self::ended(TickStatus::Empty, 0)
    }

    pub fn ended(status: TickStatus, fetched: usize) -> Self {
        Self {
            fetched,
            processed: 0,
            retried: 0,
            status,
        }
    }

    pub fn completed(fetched: usize, processed: usize, retried: usize) -> Self {
        Self {
            fetched,
            processed,
            retried,
            status: TickStatus::Completed,
        }
    }
}
