// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// A platform user, created on first authentication. Never deleted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: String,
    pub created_at: SystemTime,
}
