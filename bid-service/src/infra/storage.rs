// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::storage::{Storage, Tx};
use auction_common::domain::{
    Auction, AuctionSettings, AuctionStatus, Bid, BidStatus, ProcessingStatus, Round, RoundStatus,
    Transaction, Wallet,
};
use auction_common::infra::pool::PostgresPool;
use fastrace::trace;
use indoc::indoc;
use std::time::SystemTime;
use uuid::Uuid;

/// Postgres-backed [Storage]. All methods operate against the transaction the caller began with
/// [PostgresStorage::begin], so `place_bid`'s whole algorithm commits or rolls back atomically.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PostgresPool,
}

impl PostgresStorage {
    pub fn new(pool: PostgresPool) -> Self {
        PostgresStorage { pool }
    }

    #[cfg(test)]
    pub fn pool_for_test(&self) -> PostgresPool {
        self.pool.clone()
    }
}

impl Storage for PostgresStorage {
    #[trace]
    async fn begin(&self) -> Result<Tx, sqlx::Error> {
        self.pool.begin().await
    }

    #[trace]
    async fn commit(&self, tx: Tx) -> Result<(), sqlx::Error> {
        tx.commit().await
    }

    #[trace]
    async fn load_auction(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Option<Auction>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, name, status, seller_id, seller_wallet_id,
                   antisniping_secs, min_bid, min_bid_difference
            FROM auctions
            WHERE id = $1
            FOR UPDATE
        "};

        let row = sqlx::query_as::<_, AuctionRow>(query)
            .bind(auction_id)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let rounds = load_rounds(tx, auction_id).await?;

        Ok(Some(row.into_auction(rounds)))
    }

    #[trace]
    async fn load_wallet_by_user(&self, tx: &mut Tx, user_id: Uuid) -> Result<Option<Wallet>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, user_id, balance, locked_balance
            FROM wallets
            WHERE user_id = $1
            FOR UPDATE
        "};

        sqlx::query_as::<_, Wallet>(query)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
    }

    #[trace]
    async fn load_active_bid(
        &self,
        tx: &mut Tx,
        user_id: Uuid,
        auction_id: Uuid,
    ) -> Result<Option<Bid>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, user_id, auction_id, amount, status, created_at, updated_at
            FROM bids
            WHERE auction_id = $1 AND user_id = $2 AND status = 'ACTIVE'
            FOR UPDATE
        "};

        sqlx::query_as::<_, BidRow>(query)
            .bind(auction_id)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .map(|row| row.map(BidRow::into_bid))
    }

    #[trace]
    async fn insert_bid(&self, tx: &mut Tx, bid: &Bid) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO bids (id, user_id, auction_id, amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'ACTIVE', $5, $6)
        "};

        sqlx::query(query)
            .bind(bid.id)
            .bind(bid.user_id)
            .bind(bid.auction_id)
            .bind(bid.amount)
            .bind(bid.created_at)
            .bind(bid.updated_at)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn update_bid_amount(
        &self,
        tx: &mut Tx,
        bid_id: Uuid,
        amount: i64,
        updated_at: SystemTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bids SET amount = $1, updated_at = $2 WHERE id = $3")
            .bind(amount)
            .bind(updated_at)
            .bind(bid_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn update_wallet_locked_balance(
        &self,
        tx: &mut Tx,
        wallet_id: Uuid,
        locked_balance: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE wallets SET locked_balance = $1 WHERE id = $2")
            .bind(locked_balance)
            .bind(wallet_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn insert_transaction(&self, tx: &mut Tx, transaction: &Transaction) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO transactions
                (id, from_wallet_id, to_wallet_id, amount, type,
                 related_entity_id, related_entity_type, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "};

        sqlx::query(query)
            .bind(transaction.id)
            .bind(transaction.from_wallet_id)
            .bind(transaction.to_wallet_id)
            .bind(transaction.amount)
            .bind(transaction.r#type.to_string())
            .bind(transaction.related_entity_id)
            .bind(&transaction.related_entity_type)
            .bind(&transaction.description)
            .bind(transaction.created_at)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn update_round_end_time(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        end_time: SystemTime,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE rounds SET end_time = $1 WHERE auction_id = $2 AND round_index = $3
        "};

        sqlx::query(query)
            .bind(end_time)
            .bind(auction_id)
            .bind(round_index)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}

async fn load_rounds(tx: &mut Tx, auction_id: Uuid) -> Result<Vec<Round>, sqlx::Error> {
    let query = indoc! {"
        SELECT auction_id, round_index, start_time, end_time, status, processing_status
        FROM rounds
        WHERE auction_id = $1
        ORDER BY round_index ASC
    "};

    let rows = sqlx::query_as::<_, RoundRow>(query)
        .bind(auction_id)
        .fetch_all(&mut **tx)
        .await?;

    let mut rounds = Vec::with_capacity(rows.len());
    for row in rows {
        let item_ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT item_id FROM round_items WHERE auction_id = $1 AND round_index = $2",
        )
        .bind(auction_id)
        .bind(row.round_index)
        .fetch_all(&mut **tx)
        .await?;

        rounds.push(row.into_round(item_ids));
    }

    Ok(rounds)
}

#[derive(sqlx::FromRow)]
struct AuctionRow {
    id: Uuid,
    name: String,
    status: String,
    seller_id: Uuid,
    seller_wallet_id: Uuid,
    antisniping_secs: i64,
    min_bid: i64,
    min_bid_difference: i64,
}

impl AuctionRow {
    fn into_auction(self, rounds: Vec<Round>) -> Auction {
        Auction {
            id: self.id,
            name: self.name,
            status: parse_auction_status(&self.status),
            seller_id: self.seller_id,
            seller_wallet_id: self.seller_wallet_id,
            settings: AuctionSettings {
                antisniping_secs: self.antisniping_secs,
                min_bid: self.min_bid,
                min_bid_difference: self.min_bid_difference,
            },
            rounds,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RoundRow {
    auction_id: Uuid,
    round_index: i32,
    start_time: SystemTime,
    end_time: SystemTime,
    status: String,
    processing_status: String,
}

impl RoundRow {
    fn into_round(self, item_ids: Vec<Uuid>) -> Round {
        Round {
            auction_id: self.auction_id,
            round_index: self.round_index,
            start_time: self.start_time,
            end_time: self.end_time,
            status: parse_round_status(&self.status),
            processing_status: parse_processing_status(&self.processing_status),
            item_ids,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BidRow {
    id: Uuid,
    user_id: Uuid,
    auction_id: Uuid,
    amount: i64,
    status: String,
    created_at: SystemTime,
    updated_at: SystemTime,
}

impl BidRow {
    fn into_bid(self) -> Bid {
        Bid {
            id: self.id,
            user_id: self.user_id,
            auction_id: self.auction_id,
            amount: self.amount,
            status: parse_bid_status(&self.status),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn parse_auction_status(status: &str) -> AuctionStatus {
    match status {
        "ACTIVE" => AuctionStatus::Active,
        "ENDED" => AuctionStatus::Ended,
        "CANCELLED" => AuctionStatus::Cancelled,
        other => unreachable!("unexpected auction status in database: {other}"),
    }
}

fn parse_round_status(status: &str) -> RoundStatus {
    match status {
        "ACTIVE" => RoundStatus::Active,
        "ENDED" => RoundStatus::Ended,
        "CANCELLED" => RoundStatus::Cancelled,
        other => unreachable!("unexpected round status in database: {other}"),
    }
}

fn parse_processing_status(status: &str) -> ProcessingStatus {
    match status {
        "PENDING" => ProcessingStatus::Pending,
        "ACTIVE" => ProcessingStatus::Active,
        "PROCESSING_WINNERS" => ProcessingStatus::ProcessingWinners,
        "PROCESSING_TRANSFERS" => ProcessingStatus::ProcessingTransfers,
        "PROCESSING_LOSERS" => ProcessingStatus::ProcessingLosers,
        "COMPLETED" => ProcessingStatus::Completed,
        "FAILED" => ProcessingStatus::Failed,
        other => unreachable!("unexpected processing status in database: {other}"),
    }
}

fn parse_bid_status(status: &str) -> BidStatus {
    match status {
        "ACTIVE" => BidStatus::Active,
        "WON" => BidStatus::Won,
        "LOST" => BidStatus::Lost,
        other => unreachable!("unexpected bid status in database: {other}"),
    }
}
