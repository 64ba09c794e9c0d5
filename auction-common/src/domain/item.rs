// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An auctionable item, unique by `(collection_name, num)`. Created externally; `owner_id` is
/// mutated only by the Finalizer's transfer-items stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Item {
    pub id: Uuid,
    pub collection_name: String,
    pub num: i32,
    pub value: i64,
    pub owner_id: Uuid,
}
