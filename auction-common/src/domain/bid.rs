// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// At most one ACTIVE bid per (user, auction). Status is transitioned only by the Finalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub user_id: Uuid,
    pub auction_id: Uuid,
    pub amount: i64,
    pub status: BidStatus,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Active,
    Won,
    Lost,
}

/// Typed failure reasons for `placeBid`, surfaced verbatim as the HTTP `reason` field (§6/§7).
/// Validation, state and resource errors are client-visible and never retried; `Transient`
/// errors are internal and retried up to a bounded budget before surfacing as a 5xx.
#[derive(Debug, Error)]
pub enum PlaceBidError {
    #[error("auction {0} does not exist")]
    NoSuchAuction(Uuid),

    #[error("user {0} does not exist")]
    NoSuchWallet(Uuid),

    #[error("auction is not accepting bids")]
    AuctionEnded,

    #[error("round has already expired")]
    RoundExpired,

    #[error("amount is below the auction's minimum bid")]
    BelowMinBid,

    #[error("amount must be strictly higher than the current bid")]
    NotHigher,

    #[error("amount does not meet the minimum bid difference")]
    BelowMinDifference,

    #[error("wallet does not have enough available balance")]
    NotEnough,

    #[error("amount out of range")]
    AmountOutOfRange,

    #[error("lock unavailable, try again")]
    LockUnavailable(#[source] anyhow::Error),

    #[error("transient storage failure")]
    Transient(#[source] anyhow::Error),
}

impl PlaceBidError {
    /// Stable machine-readable reason, the `reason` field of the HTTP error contract.
    pub fn reason(&self) -> &'static str {
        match self {
            PlaceBidError::NoSuchAuction(_) => "NO_SUCH_AUCTION",
            PlaceBidError::NoSuchWallet(_) => "NO_SUCH_WALLET",
            PlaceBidError::AuctionEnded => "AUCTION_ENDED",
            PlaceBidError::RoundExpired => "ROUND_EXPIRED",
            PlaceBidError::BelowMinBid => "BELOW_MIN_BID",
            PlaceBidError::NotHigher => "NOT_HIGHER",
            PlaceBidError::BelowMinDifference => "BELOW_MIN_DIFFERENCE",
            PlaceBidError::NotEnough => "NOT_ENOUGH",
            PlaceBidError::AmountOutOfRange => "AMOUNT_OUT_OF_RANGE",
            PlaceBidError::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            PlaceBidError::Transient(_) => "TRANSIENT",
        }
    }

    /// Whether the caller (or the consumer redelivery policy) may retry as-is.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PlaceBidError::LockUnavailable(_) | PlaceBidError::Transient(_)
        )
    }
}

impl From<crate::domain::lock::LockError> for PlaceBidError {
    fn from(error: crate::domain::lock::LockError) -> Self {
        PlaceBidError::LockUnavailable(error.into())
    }
}

impl From<sqlx::Error> for PlaceBidError {
    fn from(error: sqlx::Error) -> Self {
        PlaceBidError::Transient(error.into())
    }
}
