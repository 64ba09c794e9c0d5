// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use auction_common::domain::{Auction, Bid, Transaction, Wallet};
use std::time::SystemTime;
use uuid::Uuid;

/// Postgres transaction handle shared by all write operations of a single `place_bid` call.
pub type Tx = sqlx::Transaction<'static, sqlx::Postgres>;

/// Storage abstraction for the bid-placement critical section. Every method operates within
/// the caller-supplied transaction so the whole algorithm commits or rolls back atomically.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    async fn begin(&self) -> Result<Tx, sqlx::Error>;

    async fn commit(&self, tx: Tx) -> Result<(), sqlx::Error>;

    /// Loads the auction together with its rounds, ordered by `round_index`.
    async fn load_auction(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Option<Auction>, sqlx::Error>;

    async fn load_wallet_by_user(&self, tx: &mut Tx, user_id: Uuid) -> Result<Option<Wallet>, sqlx::Error>;

    async fn load_active_bid(
        &self,
        tx: &mut Tx,
        user_id: Uuid,
        auction_id: Uuid,
    ) -> Result<Option<Bid>, sqlx::Error>;

    async fn insert_bid(&self, tx: &mut Tx, bid: &Bid) -> Result<(), sqlx::Error>;

    async fn update_bid_amount(
        &self,
        tx: &mut Tx,
        bid_id: Uuid,
        amount: i64,
        updated_at: SystemTime,
    ) -> Result<(), sqlx::Error>;

    async fn update_wallet_locked_balance(
        &self,
        tx: &mut Tx,
        wallet_id: Uuid,
        locked_balance: i64,
    ) -> Result<(), sqlx::Error>;

    async fn insert_transaction(&self, tx: &mut Tx, transaction: &Transaction) -> Result<(), sqlx::Error>;

    async fn update_round_end_time(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        end_time: SystemTime,
    ) -> Result<(), sqlx::Error>;
}
