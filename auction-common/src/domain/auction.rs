// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// A named sale with one seller and an ordered list of rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub id: Uuid,
    pub name: String,
    pub status: AuctionStatus,
    pub seller_id: Uuid,
    pub seller_wallet_id: Uuid,
    pub settings: AuctionSettings,
    pub rounds: Vec<Round>,
}

impl Auction {
    pub fn is_last_round(&self, round_index: i32) -> bool {
        self.rounds
            .iter()
            .map(|r| r.round_index)
            .max()
            .is_some_and(|max| max == round_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionStatus {
    Active,
    Ended,
    Cancelled,
}

/// Per-auction overrides; absent fields fall back to the defaults noted per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionSettings {
    /// Seconds a late bid extends a round's end by; `0` disables anti-sniping.
    pub antisniping_secs: i64,
    pub min_bid: i64,
    /// Defaults to `0`, which collapses the raise check to "strictly greater".
    pub min_bid_difference: i64,
}

impl Default for AuctionSettings {
    fn default() -> Self {
        AuctionSettings {
            antisniping_secs: 0,
            min_bid: 0,
            min_bid_difference: 0,
        }
    }
}

/// A time-bounded sub-auction with its own item set, independently finalized. The round index
/// (stable within its auction) is its identifier; rounds are embedded in the source model but
/// normalized into their own table here (see `SPEC_FULL.md`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub auction_id: Uuid,
    pub round_index: i32,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub status: RoundStatus,
    pub processing_status: ProcessingStatus,
    pub item_ids: Vec<Uuid>,
}

impl Round {
    /// A bid arriving at exactly `end_time` is treated as expired (spec §9 open question).
    pub fn has_expired(&self, now: SystemTime) -> bool {
        self.end_time <= now
    }

    pub fn is_active_and_ended(&self, now: SystemTime) -> bool {
        self.status == RoundStatus::Active && self.has_expired(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    Active,
    Ended,
    Cancelled,
}

/// Monotonically advancing per round (invariant I4); never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Active,
    ProcessingWinners,
    ProcessingTransfers,
    ProcessingLosers,
    Completed,
    Failed,
}

impl ProcessingStatus {
    /// Whether advancing from `self` to `next` respects invariant I4 (no regression).
    pub fn can_advance_to(self, next: ProcessingStatus) -> bool {
        next >= self
    }
}

/// Finds the round currently accepting bids: the lowest-indexed round still ACTIVE. A bid
/// arriving once that round has expired is rejected as `RoundExpired` even if the auction's
/// status is otherwise ACTIVE (spec §9 open question); an auction with no ACTIVE round left at
/// all is rejected as `AuctionEnded` (spec §4.2 step 1).
pub fn find_biddable_round(
    auction: &Auction,
    now: SystemTime,
) -> Result<&Round, crate::domain::bid::PlaceBidError> {
    use crate::domain::bid::PlaceBidError;

    if auction.status != AuctionStatus::Active {
        return Err(PlaceBidError::AuctionEnded);
    }

    let mut active_rounds: Vec<&Round> = auction
        .rounds
        .iter()
        .filter(|round| round.status == RoundStatus::Active)
        .collect();

    if active_rounds.is_empty() {
        return Err(PlaceBidError::AuctionEnded);
    }

    active_rounds.sort_by_key(|round| round.round_index);
    let current = active_rounds[0];

    if current.has_expired(now) {
        return Err(PlaceBidError::RoundExpired);
    }

    Ok(current)
}

/// Implements the bid-service anti-sniping cascade (spec §4.2 step 6): a late bid pushes its
/// round's `end_time` out to `now + antisniping`, then cascades the same threshold forward
/// through subsequent still-active rounds without ever shortening them. Returns the earliest
/// `end_time > now` across all rounds after adjustment, i.e. the caller's `newEndTime`.
pub fn apply_anti_sniping(
    rounds: &mut [Round],
    now: SystemTime,
    antisniping_secs: i64,
) -> Option<SystemTime> {
    if antisniping_secs <= 0 {
        return rounds
            .iter()
            .filter(|r| r.end_time > now)
            .map(|r| r.end_time)
            .min();
    }

    let extension = Duration::from_secs(antisniping_secs as u64);
    let mut threshold = now + extension;

    for round in rounds.iter_mut().filter(|r| r.end_time > now) {
        if threshold > round.end_time {
            round.end_time = threshold;
            threshold += extension;
        }
    }

    rounds
        .iter()
        .filter(|r| r.end_time > now)
        .map(|r| r.end_time)
        .min()
}
