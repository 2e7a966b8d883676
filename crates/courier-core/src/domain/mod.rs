//! Domain model (ids, item capabilities, outcomes, errors).

pub mod errors;
pub mod features;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod status;

pub use self::errors::{HandlerError, OutboxError, OutboxResult};
pub use self::features::ItemFeatures;
pub use self::ids::ItemId;
pub use self::item::OutboxItem;
pub use self::outcome::{BatchResult, HandleResult, TickReport, TickStatus};
pub use self::status::{OutboxItemStatus, StatusFields};
