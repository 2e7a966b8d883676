//! IdGenerator port - ID 生成の抽象化
//!
//! Outbox rows are inserted by the owning application, inside its own business
//! transaction. This generator is what it uses to mint their ids.
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ItemId;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> ItemId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// The timestamp part comes from the clock, so a `ManualClock` pins the
/// partition an id lands in.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_item_id(&self) -> ItemId {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        ItemId::from(ulid)
    }
}
