// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::storage::{Storage, Tx};
use auction_common::domain::{
    Auction, AuctionSettings, AuctionStatus, Bid, BidStatus, Item, ProcessingStatus, Round,
    RoundStatus, Transaction,
};
use auction_common::infra::pool::PostgresPool;
use fastrace::trace;
use indoc::indoc;
use std::time::SystemTime;
use uuid::Uuid;

/// Postgres-backed [Storage]. All methods operate against the transaction the caller began
/// with [PostgresStorage::begin], so each stage body commits or rolls back atomically.
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
    async fn due_round_indices(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        now: SystemTime,
    ) -> Result<Vec<i32>, sqlx::Error> {
        let query = indoc! {"
            SELECT round_index
            FROM rounds
            WHERE auction_id = $1 AND status = 'ACTIVE' AND end_time < $2
            ORDER BY round_index ASC
        "};

        sqlx::query_scalar::<_, i32>(query)
            .bind(auction_id)
            .bind(now)
            .fetch_all(&mut **tx)
            .await
    }

    #[trace]
    async fn set_round_processing_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        processing_status: ProcessingStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE rounds SET processing_status = $1 WHERE auction_id = $2 AND round_index = $3",
        )
        .bind(processing_status_str(processing_status))
        .bind(auction_id)
        .bind(round_index)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    #[trace]
    async fn set_round_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
        status: RoundStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE rounds SET status = $1 WHERE auction_id = $2 AND round_index = $3")
            .bind(round_status_str(status))
            .bind(auction_id)
            .bind(round_index)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn set_auction_status(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        status: AuctionStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE auctions SET status = $1 WHERE id = $2")
            .bind(auction_status_str(status))
            .bind(auction_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn load_round_items_sorted(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
    ) -> Result<Vec<Item>, sqlx::Error> {
        let query = indoc! {"
            SELECT i.id, i.collection_name, i.num, i.value, i.owner_id
            FROM items i
            JOIN round_items ri ON ri.item_id = i.id
            WHERE ri.auction_id = $1 AND ri.round_index = $2
            ORDER BY i.num ASC
            FOR UPDATE OF i
        "};

        sqlx::query_as::<_, Item>(query)
            .bind(auction_id)
            .bind(round_index)
            .fetch_all(&mut **tx)
            .await
    }

    #[trace]
    async fn load_active_bids_sorted(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Vec<Bid>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, user_id, auction_id, amount, status, created_at, updated_at
            FROM bids
            WHERE auction_id = $1 AND status = 'ACTIVE'
            ORDER BY amount DESC, created_at ASC
            FOR UPDATE
        "};

        let rows = sqlx::query_as::<_, BidRow>(query)
            .bind(auction_id)
            .fetch_all(&mut **tx)
            .await?;

        Ok(rows.into_iter().map(BidRow::into_bid).collect())
    }

    #[trace]
    async fn mark_bids_won(
        &self,
        tx: &mut Tx,
        bid_ids: &[Uuid],
        round_index: i32,
        updated_at: SystemTime,
    ) -> Result<(), sqlx::Error> {
        if bid_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE bids SET status = 'WON', won_round_index = $1, updated_at = $2 WHERE id = ANY($3)",
        )
        .bind(round_index)
        .bind(updated_at)
        .bind(bid_ids)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    #[trace]
    async fn load_won_bids_for_round_sorted(
        &self,
        tx: &mut Tx,
        auction_id: Uuid,
        round_index: i32,
    ) -> Result<Vec<Bid>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, user_id, auction_id, amount, status, created_at, updated_at
            FROM bids
            WHERE auction_id = $1 AND status = 'WON' AND won_round_index = $2
            ORDER BY amount DESC, created_at ASC
        "};

        let rows = sqlx::query_as::<_, BidRow>(query)
            .bind(auction_id)
            .bind(round_index)
            .fetch_all(&mut **tx)
            .await?;

        Ok(rows.into_iter().map(BidRow::into_bid).collect())
    }

    #[trace]
    async fn set_item_owner(&self, tx: &mut Tx, item_id: Uuid, owner_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE items SET owner_id = $1 WHERE id = $2")
            .bind(owner_id)
            .bind(item_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn load_wallet_by_user(&self, tx: &mut Tx, user_id: Uuid) -> Result<Option<auction_common::domain::Wallet>, sqlx::Error> {
        sqlx::query_as("SELECT id, user_id, balance, locked_balance FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
    }

    #[trace]
    async fn load_wallet_by_id(&self, tx: &mut Tx, wallet_id: Uuid) -> Result<Option<auction_common::domain::Wallet>, sqlx::Error> {
        sqlx::query_as("SELECT id, user_id, balance, locked_balance FROM wallets WHERE id = $1 FOR UPDATE")
            .bind(wallet_id)
            .fetch_optional(&mut **tx)
            .await
    }

    #[trace]
    async fn update_wallet_balances(
        &self,
        tx: &mut Tx,
        wallet_id: Uuid,
        balance: i64,
        locked_balance: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE wallets SET balance = $1, locked_balance = $2 WHERE id = $3")
            .bind(balance)
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
    async fn load_all_active_bids(&self, tx: &mut Tx, auction_id: Uuid) -> Result<Vec<Bid>, sqlx::Error> {
        let query = indoc! {"
            SELECT id, user_id, auction_id, amount, status, created_at, updated_at
            FROM bids
            WHERE auction_id = $1 AND status = 'ACTIVE'
            FOR UPDATE
        "};

        let rows = sqlx::query_as::<_, BidRow>(query)
            .bind(auction_id)
            .fetch_all(&mut **tx)
            .await?;

        Ok(rows.into_iter().map(BidRow::into_bid).collect())
    }

    #[trace]
    async fn mark_bid_lost(&self, tx: &mut Tx, bid_id: Uuid, updated_at: SystemTime) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE bids SET status = 'LOST', updated_at = $1 WHERE id = $2")
            .bind(updated_at)
            .bind(bid_id)
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
        let item_ids = load_item_ids(tx, auction_id, row.round_index).await?;
        rounds.push(row.into_round(item_ids));
    }

    Ok(rounds)
}

async fn load_item_ids(tx: &mut Tx, auction_id: Uuid, round_index: i32) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        "SELECT item_id FROM round_items WHERE auction_id = $1 AND round_index = $2",
    )
    .bind(auction_id)
    .bind(round_index)
    .fetch_all(&mut **tx)
    .await
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

fn auction_status_str(status: AuctionStatus) -> &'static str {
    match status {
        AuctionStatus::Active => "ACTIVE",
        AuctionStatus::Ended => "ENDED",
        AuctionStatus::Cancelled => "CANCELLED",
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

fn round_status_str(status: RoundStatus) -> &'static str {
    match status {
        RoundStatus::Active => "ACTIVE",
        RoundStatus::Ended => "ENDED",
        RoundStatus::Cancelled => "CANCELLED",
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

fn processing_status_str(status: ProcessingStatus) -> &'static str {
    match status {
        ProcessingStatus::Pending => "PENDING",
        ProcessingStatus::Active => "ACTIVE",
        ProcessingStatus::ProcessingWinners => "PROCESSING_WINNERS",
        ProcessingStatus::ProcessingTransfers => "PROCESSING_TRANSFERS",
        ProcessingStatus::ProcessingLosers => "PROCESSING_LOSERS",
        ProcessingStatus::Completed => "COMPLETED",
        ProcessingStatus::Failed => "FAILED",
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
