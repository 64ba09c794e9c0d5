// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// An append-only ledger entry. Never mutated or deleted once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub from_wallet_id: Uuid,
    /// `None` means the amount was locked against the wallet, not moved elsewhere.
    pub to_wallet_id: Option<Uuid>,
    pub amount: i64,
    pub r#type: TransactionType,
    pub related_entity_id: Option<Uuid>,
    pub related_entity_type: Option<String>,
    pub description: String,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Bid,
    IncreaseBid,
    Transfer,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionType::Bid => "BID",
            TransactionType::IncreaseBid => "INCREASE_BID",
            TransactionType::Transfer => "TRANSFER",
        };
        f.write_str(s)
    }
}
