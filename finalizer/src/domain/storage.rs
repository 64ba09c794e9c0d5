// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use auction_common::domain::{Auction, Bid, Item, Transaction, Wallet};
use std::time::SystemTime;
use uuid::Uuid;

/// Postgres transaction handle shared by all writes of a single stage body, so each stage
/// commits or rolls back atomically (spec §4.3 idempotence note).
pub type Tx = sqlx::Transaction<'static, sqlx::Postgres>;

/// Storage abstraction for the finalization pipeline. Every method operates within the
/// caller-supplied transaction.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    async fn begin(&self) -> Result<Tx, sqlx::Error>;

    async fn commit(&self, tx: Tx) -> Result<(), sqlx::Error>;

    /// Loads the auction together with its rounds, ordered by `round_index`.
    async fn load_auction(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Option<Auction>, sqlx::Error>;

    /// Round indices that are `status = ACTIVE` and whose `end_time` has passed, i.e. the
    /// set `onTrigger` (spec §4.3) publishes a `DETERMINE_WINNERS` stage message for.
    async fn due_round_indices(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        now: SystemTime,
    ) -> Result<Vec<i32>, sqlx::Error>;

    async fn set_round_processing_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        processing_status: auction_common::domain::ProcessingStatus,
    ) -> Result<(), sqlx::Error>;

    async fn set_round_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        status: auction_common::domain::RoundStatus,
    ) -> Result<(), sqlx::Error>;

    async fn set_auction_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        status: auction_common::domain::AuctionStatus,
    ) -> Result<(), sqlx::Error>;

    /// Items of the round, ordered by `num` ascending (spec §4.3 DETERMINE_WINNERS/TRANSFER_ITEMS).
    async fn load_round_items_sorted(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
    ) -> Result<Vec<Item>, sqlx::Error>;

    /// ACTIVE bids of the whole auction, ordered by `(amount DESC, created_at ASC)`.
    async fn load_active_bids_sorted(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Vec<Bid>, sqlx::Error>;

    /// Flips the given bids ACTIVE -> WON and stamps them with the round whose winner-set
    /// they belong to, so later stages can re-read "the winners of round N" idempotently.
    async fn mark_bids_won(
        &self,
        tx: &mut Tx,
        bid_ids: &[Uuid],
        round_index: i32,
        updated_at: SystemTime,
    ) -> Result<(), sqlx::Error>;

    /// WON bids stamped with `round_index`, ordered by `(amount DESC, created_at ASC)` —
    /// stable across retries (spec §4.3 TRANSFER_ITEMS/PROCESS_PAYMENTS).
    async fn load_won_bids_for_round_sorted(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
    ) -> Result<Vec<Bid>, sqlx::Error>;

    async fn set_item_owner(&self, tx: &mut Tx, item_id: Uuid, owner_id: Uuid) -> Result<(), sqlx::Error>;

    async fn load_wallet_by_user(&self, tx: &mut Tx, user_id: Uuid) -> Result<Option<Wallet>, sqlx::Error>;

    async fn load_wallet_by_id(&self, tx: &mut Tx, wallet_id: Uuid) -> Result<Option<Wallet>, sqlx::Error>;

    async fn update_wallet_balances(
        &self,
        tx: &mut Tx,
        wallet_id: Uuid,
        balance: i64,
        locked_balance: i64,
    ) -> Result<(), sqlx::Error>;

    async fn insert_transaction(&self, tx: &mut Tx, transaction: &Transaction) -> Result<(), sqlx::Error>;

    /// ACTIVE bids of the whole auction — the auction-wide losers once the last round's
    /// payments have settled (spec §4.3 REFUND_LOSERS).
    async fn load_all_active_bids(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Vec<Bid>, sqlx::Error>;

    async fn mark_bid_lost(&self, tx: &mut Tx, bid_id: Uuid, updated_at: SystemTime) -> Result<(), sqlx::Error>;
}
