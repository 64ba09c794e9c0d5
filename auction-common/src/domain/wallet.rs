// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One wallet per user, in single-currency integer minor units. Mutated exclusively by the
/// Bid Service (locking) and the Finalizer (settlement).
///
/// Invariant I1: `0 <= locked_balance <= balance` must hold after every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: i64,
    pub locked_balance: i64,
}

impl Wallet {
    /// Balance not reserved against any outstanding ACTIVE bid.
    pub fn available(&self) -> i64 {
        self.balance - self.locked_balance
    }

    pub fn can_lock(&self, amount: i64) -> bool {
        amount >= 0 && self.available() >= amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_is_balance_minus_locked() {
        let wallet = Wallet {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            balance: 1000,
            locked_balance: 400,
        };

        assert_eq!(wallet.available(), 600);
        assert!(wallet.can_lock(600));
        assert!(!wallet.can_lock(601));
    }
}
