// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::storage::{Storage, Tx};
use auction_common::domain::{
    Auction, Bid, Clock, DelayedBus, DistributedLock, ProcessingStatus, Round, RoundStatus,
    Stage, StageMessage, Transaction, TransactionType, lock::with_lock,
};
use log::info;
use metrics::{counter, histogram};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use uuid::Uuid;

const AUCTION_LOCK_TTL: Duration = Duration::from_secs(60);
const LOCK_MAX_WAIT: Duration = Duration::from_secs(10);

/// Typed failure reasons for the finalization pipeline (spec §7). `DataIntegrity` is
/// non-retriable and dead-lettered by the consumer; everything else is requeued with bounded
/// backoff.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("auction {0} does not exist")]
    NoSuchAuction(Uuid),

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("lock unavailable, try again")]
    LockUnavailable(#[source] anyhow::Error),

    #[error("transient storage failure")]
    Transient(#[source] anyhow::Error),
}

impl FinalizeError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FinalizeError::LockUnavailable(_) | FinalizeError::Transient(_)
        )
    }
}

impl From<auction_common::domain::LockError> for FinalizeError {
    fn from(error: auction_common::domain::LockError) -> Self {
        FinalizeError::LockUnavailable(error.into())
    }
}

impl From<sqlx::Error> for FinalizeError {
    fn from(error: sqlx::Error) -> Self {
        FinalizeError::Transient(error.into())
    }
}

/// `onTrigger` (spec §4.3 entry point): for every round that is ACTIVE and has passed its
/// `end_time`, publishes a `DETERMINE_WINNERS` stage message. Idempotent no-op if the
/// auction is no longer ACTIVE — including the common case of a duplicate Scheduler sweep
/// trigger arriving for an auction some other trigger already finalized.
pub async fn on_trigger<S, L, C, B>(
    storage: &S,
    lock: &L,
    clock: &C,
    bus: &B,
    auction_id: Uuid,
) -> Result<(), FinalizeError>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let auction_key = format!("auction:{auction_id}");
    let now = clock.now();

    let due_round_indices = with_lock(lock, &auction_key, AUCTION_LOCK_TTL, LOCK_MAX_WAIT, || async {
        let mut tx = storage.begin().await?;

        let auction = storage
            .load_auction(&mut tx, auction_id)
            .await?
            .ok_or(FinalizeError::NoSuchAuction(auction_id))?;

        if auction.status != auction_common::domain::AuctionStatus::Active {
            storage.commit(tx).await?;
            return Ok(Vec::new());
        }

        let due = storage.due_round_indices(&mut tx, auction_id, now).await?;
        storage.commit(tx).await?;

        Ok::<_, FinalizeError>(due)
    })
    .await?;

    for round_index in due_round_indices {
        let message = StageMessage {
            id: Uuid::new_v4(),
            auction_id,
            round_index,
            stage: Stage::DetermineWinners,
            published_at: now,
        };
        bus.publish_stage(message).await.map_err(|error| {
            FinalizeError::Transient(anyhow::anyhow!(error).context("publish DETERMINE_WINNERS stage"))
        })?;
    }

    Ok(())
}

/// `onStage` (spec §4.3): executes one stage's body in a database transaction under the
/// auction lock, and — only after that transaction commits — publishes the next stage.
/// Duplicate deliveries of the same stage are safe: every stage body first checks
/// `processing_status` and is a no-op if a prior delivery already applied it.
pub async fn on_stage<S, L, C, B>(
    storage: &S,
    lock: &L,
    clock: &C,
    bus: &B,
    auction_id: Uuid,
    round_index: i32,
    stage: Stage,
) -> Result<(), FinalizeError>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let auction_key = format!("auction:{auction_id}");
    let now = clock.now();

    let next_stage = with_lock(lock, &auction_key, AUCTION_LOCK_TTL, LOCK_MAX_WAIT, || async {
        let mut tx = storage.begin().await?;

        let auction = storage
            .load_auction(&mut tx, auction_id)
            .await?
            .ok_or(FinalizeError::NoSuchAuction(auction_id))?;

        let round = find_round(&auction, round_index)?;
        let is_last_round = auction.is_last_round(round_index);

        apply_stage(storage, &mut tx, &auction, round, now, stage).await?;

        storage.commit(tx).await?;

        Ok::<_, FinalizeError>(stage.next(is_last_round))
    })
    .await?;

    if let Some(next_stage) = next_stage {
        let message = StageMessage {
            id: Uuid::new_v4(),
            auction_id,
            round_index,
            stage: next_stage,
            published_at: now,
        };
        bus.publish_stage(message).await.map_err(|error| {
            FinalizeError::Transient(anyhow::anyhow!(error).context("publish next stage"))
        })?;
    }

    Ok(())
}

/// Runs every remaining stage of a round back-to-back in a single transaction (spec §4.3
/// "Synchronous mode"), for use when the delayed message bus is unavailable or in test
/// harnesses. Correctness properties are identical to the staged path.
pub async fn finalize_round_synchronously<S>(
    storage: &S,
    auction_id: Uuid,
    round_index: i32,
    now: SystemTime,
) -> Result<(), FinalizeError>
where
    S: Storage,
{
    let mut tx = storage.begin().await?;

    let auction = storage
        .load_auction(&mut tx, auction_id)
        .await?
        .ok_or(FinalizeError::NoSuchAuction(auction_id))?;

    let is_last_round = auction.is_last_round(round_index);
    let mut stage = Some(Stage::DetermineWinners);

    while let Some(current) = stage {
        let round = find_round(&auction, round_index)?.clone();
        apply_stage(storage, &mut tx, &auction, &round, now, current).await?;
        stage = current.next(is_last_round);
    }

    storage.commit(tx).await?;
    Ok(())
}

fn find_round(auction: &Auction, round_index: i32) -> Result<&Round, FinalizeError> {
    auction
        .rounds
        .iter()
        .find(|round| round.round_index == round_index)
        .ok_or_else(|| {
            FinalizeError::DataIntegrity(format!(
                "auction {} has no round {round_index}",
                auction.id
            ))
        })
}

async fn apply_stage<S>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    round: &Round,
    now: SystemTime,
    stage: Stage,
) -> Result<(), FinalizeError>
where
    S: Storage,
{
    // `Failed` sorts after `Completed` in the derived `Ord` (it's the last variant in spec §3's
    // enum), so none of the per-stage `processing_status >= X` idempotency guards below can be
    // trusted to treat it as "not yet done" — check it explicitly before they run.
    if round.processing_status == ProcessingStatus::Failed {
        return Err(FinalizeError::DataIntegrity(format!(
            "round {} of auction {} is marked FAILED; refusing further automatic processing",
            round.round_index, auction.id
        )));
    }

    let started = Instant::now();

    let result = match stage {
        Stage::DetermineWinners => determine_winners(storage, tx, auction, round, now).await,
        Stage::TransferItems => transfer_items(storage, tx, auction, round).await,
        Stage::ProcessPayments => process_payments(storage, tx, auction, round, now).await,
        Stage::RefundLosers => refund_losers(storage, tx, auction, now).await,
        Stage::Finalize => finalize(storage, tx, auction, round).await,
    };

    histogram!("stage_duration_ms", "stage" => format!("{stage:?}"))
        .record(started.elapsed().as_millis() as f64);

    result
}

/// Picks winners for `round` from the auction-wide pool of still-ACTIVE bids: the first
/// `min(items, bids)` by `(amount DESC, created_at ASC)` become WON, stamped with this round's
/// index. Earlier rounds in the same auction have already removed their own winners from the
/// ACTIVE pool, so later rounds draw from what is left (spec §4.3 table, DETERMINE_WINNERS).
async fn determine_winners<S: Storage>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    round: &Round,
    now: SystemTime,
) -> Result<(), FinalizeError> {
    if round.processing_status >= ProcessingStatus::ProcessingWinners {
        return Ok(());
    }

    if round.status != RoundStatus::Active || !round.has_expired(now) {
        return Err(FinalizeError::DataIntegrity(format!(
            "round {} of auction {} is not eligible for winner determination",
            round.round_index, auction.id
        )));
    }

    storage
        .set_round_processing_status(
            tx,
            auction.id,
            round.round_index,
            ProcessingStatus::ProcessingWinners,
        )
        .await?;

    let items = storage
        .load_round_items_sorted(tx, auction.id, round.round_index)
        .await?;
    let bids = storage.load_active_bids_sorted(tx, auction.id).await?;

    let winner_count = items.len().min(bids.len());
    let winning_bid_ids: Vec<Uuid> = bids[..winner_count].iter().map(|bid| bid.id).collect();

    storage
        .mark_bids_won(tx, &winning_bid_ids, round.round_index, now)
        .await?;

    info!(
        auction_id:% = auction.id, round_index = round.round_index,
        items_len = items.len(), bids_len = bids.len(), winners_len = winner_count;
        "winners determined"
    );

    Ok(())
}

/// Pairs round items (sorted by `num` ascending) with the round's WON bids (sorted by amount
/// descending) by index, transferring ownership. Items without a paired bid — more items than
/// bidders — retain the seller as owner (spec §4.3 table, tie-breaking rule).
async fn transfer_items<S: Storage>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    round: &Round,
) -> Result<(), FinalizeError> {
    if round.processing_status >= ProcessingStatus::ProcessingTransfers {
        return Ok(());
    }

    storage
        .set_round_processing_status(
            tx,
            auction.id,
            round.round_index,
            ProcessingStatus::ProcessingTransfers,
        )
        .await?;

    let items = storage
        .load_round_items_sorted(tx, auction.id, round.round_index)
        .await?;
    let winners = storage
        .load_won_bids_for_round_sorted(tx, auction.id, round.round_index)
        .await?;

    for (item, bid) in items.iter().zip(winners.iter()) {
        storage.set_item_owner(tx, item.id, bid.user_id).await?;
    }

    Ok(())
}

/// Settles payment for each (item, winning bid) pair: the winner's `balance` and
/// `locked_balance` both decrease by the bid amount, and the seller's `balance` is credited
/// with the sum. There is no dedicated `processing_status` for this stage (spec's table), so
/// idempotency is guarded by checking whether the round has already advanced past
/// `PROCESSING_TRANSFERS` — only PROCESS_PAYMENTS sits between that status and the next one,
/// so having moved past it means payments already settled.
async fn process_payments<S: Storage>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    round: &Round,
    now: SystemTime,
) -> Result<(), FinalizeError> {
    if round.processing_status > ProcessingStatus::ProcessingTransfers {
        return Ok(());
    }

    let winners = storage
        .load_won_bids_for_round_sorted(tx, auction.id, round.round_index)
        .await?;

    let mut seller_credit = 0i64;

    for bid in &winners {
        let mut wallet = storage
            .load_wallet_by_user(tx, bid.user_id)
            .await?
            .ok_or_else(|| {
                FinalizeError::DataIntegrity(format!("no wallet for user {}", bid.user_id))
            })?;

        wallet.balance -= bid.amount;
        wallet.locked_balance -= bid.amount;

        storage
            .update_wallet_balances(tx, wallet.id, wallet.balance, wallet.locked_balance)
            .await?;

        storage
            .insert_transaction(
                tx,
                &Transaction {
                    id: Uuid::new_v4(),
                    from_wallet_id: wallet.id,
                    to_wallet_id: Some(auction.seller_wallet_id),
                    amount: bid.amount,
                    r#type: TransactionType::Transfer,
                    related_entity_id: Some(auction.id),
                    related_entity_type: Some("AUCTION".to_string()),
                    description: format!(
                        "settlement for round {} of auction {}",
                        round.round_index, auction.id
                    ),
                    created_at: now,
                },
            )
            .await?;

        seller_credit += bid.amount;
    }

    if seller_credit > 0 {
        let mut seller_wallet = storage
            .load_wallet_by_id(tx, auction.seller_wallet_id)
            .await?
            .ok_or_else(|| {
                FinalizeError::DataIntegrity(format!(
                    "no seller wallet {}",
                    auction.seller_wallet_id
                ))
            })?;

        seller_wallet.balance += seller_credit;

        storage
            .update_wallet_balances(tx, seller_wallet.id, seller_wallet.balance, seller_wallet.locked_balance)
            .await?;
    }

    info!(
        auction_id:% = auction.id, round_index = round.round_index,
        winners_len = winners.len(), seller_credit;
        "payments settled"
    );

    Ok(())
}

/// Reads every bid still ACTIVE on the auction — the auction-wide losers, across all rounds —
/// *before* flipping any of them, so a crash between the read and the flip never loses the
/// list on partial commit (spec §9 open question resolution).
async fn refund_losers<S: Storage>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    now: SystemTime,
) -> Result<(), FinalizeError> {
    let round = auction
        .rounds
        .iter()
        .max_by_key(|round| round.round_index)
        .ok_or_else(|| FinalizeError::DataIntegrity(format!("auction {} has no rounds", auction.id)))?;

    if round.processing_status >= ProcessingStatus::ProcessingLosers {
        return Ok(());
    }

    storage
        .set_round_processing_status(tx, auction.id, round.round_index, ProcessingStatus::ProcessingLosers)
        .await?;

    let losers: Vec<Bid> = storage.load_all_active_bids(tx, auction.id).await?;

    for bid in &losers {
        let mut wallet = storage
            .load_wallet_by_user(tx, bid.user_id)
            .await?
            .ok_or_else(|| {
                FinalizeError::DataIntegrity(format!("no wallet for user {}", bid.user_id))
            })?;

        wallet.locked_balance -= bid.amount;

        storage
            .update_wallet_balances(tx, wallet.id, wallet.balance, wallet.locked_balance)
            .await?;
        storage.mark_bid_lost(tx, bid.id, now).await?;
    }

    info!(auction_id:% = auction.id, losers_len = losers.len(); "losers refunded");

    Ok(())
}

/// Marks the round `COMPLETED`/`ENDED`, and the auction `ENDED` if this was its last round.
async fn finalize<S: Storage>(
    storage: &S,
    tx: &mut Tx,
    auction: &Auction,
    round: &Round,
) -> Result<(), FinalizeError> {
    if round.processing_status == ProcessingStatus::Completed {
        return Ok(());
    }

    storage
        .set_round_processing_status(tx, auction.id, round.round_index, ProcessingStatus::Completed)
        .await?;
    storage
        .set_round_status(tx, auction.id, round.round_index, RoundStatus::Ended)
        .await?;

    if auction.is_last_round(round.round_index) {
        storage
            .set_auction_status(tx, auction.id, auction_common::domain::AuctionStatus::Ended)
            .await?;
    }

    counter!("round_finalized_total").increment(1);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_error_reports_retriability() {
        let data_integrity = FinalizeError::DataIntegrity("missing round".to_string());
        assert!(!data_integrity.is_retriable());

        let transient = FinalizeError::Transient(anyhow::anyhow!("db down"));
        assert!(transient.is_retriable());
    }

    mod postgres {
        use crate::domain::storage::Storage;
        use crate::infra::storage::PostgresStorage;
        use anyhow::Context;
        use auction_common::infra::{
            migrations,
            pool::{Config, PostgresPool, SslMode},
        };
        use std::{
            error::Error as StdError,
            time::{Duration, SystemTime},
        };
        use testcontainers::{ImageExt, runners::AsyncRunner};
        use testcontainers_modules::postgres::Postgres;
        use uuid::Uuid;

        use super::super::{FinalizeError, apply_stage, finalize_round_synchronously};
        use auction_common::domain::{Auction, ProcessingStatus, Round, Stage};

        async fn start_storage() -> Result<PostgresStorage, Box<dyn StdError>> {
            let container = Postgres::default()
                .with_db_name("auction")
                .with_user("auction")
                .with_password("auction")
                .with_tag("17.1-alpine")
                .start()
                .await
                .context("start Postgres container")?;
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .context("get Postgres port")?;

            let config = Config {
                host: "localhost".to_string(),
                port,
                dbname: "auction".to_string(),
                user: "auction".to_string(),
                password: "auction".to_string(),
                sslmode: SslMode::Prefer,
                max_connections: 10,
                idle_timeout: Duration::from_secs(60),
                max_lifetime: Duration::from_secs(5 * 60),
            };
            let pool = PostgresPool::new(config).await?;
            migrations::run(&pool).await?;

            Ok(PostgresStorage::new(pool))
        }

        /// One user + one wallet, returning (user_id, wallet_id).
        async fn insert_user_and_wallet(
            pool: &PostgresPool,
            balance: i64,
            locked_balance: i64,
        ) -> Result<(Uuid, Uuid), sqlx::Error> {
            let user_id = Uuid::new_v4();
            let wallet_id = Uuid::new_v4();

            sqlx::query("INSERT INTO users (id, telegram_id) VALUES ($1, $2)")
                .bind(user_id)
                .bind(user_id.to_string())
                .execute(&**pool)
                .await?;
            sqlx::query(
                "INSERT INTO wallets (id, user_id, balance, locked_balance) VALUES ($1, $2, $3, $4)",
            )
            .bind(wallet_id)
            .bind(user_id)
            .bind(balance)
            .bind(locked_balance)
            .execute(&**pool)
            .await?;

            Ok((user_id, wallet_id))
        }

        /// Scenario 5 (spec §8): 3 items, 4 bidders at 100/200/300/400 on a single, already
        /// expired round. Winners are the top 3 bids; the lowest bidder is refunded. Exercises
        /// `finalize_round_synchronously`'s full five-stage run in one transaction.
        #[tokio::test]
        async fn three_items_four_bidders_settles_correctly() -> Result<(), Box<dyn StdError>> {
            let storage = start_storage().await?;
            let pool = storage.pool_for_test();

            let (seller_id, seller_wallet_id) = insert_user_and_wallet(&pool, 0, 0).await?;
            let auction_id = Uuid::new_v4();

            sqlx::query(
                "INSERT INTO auctions
                    (id, name, status, seller_id, seller_wallet_id,
                     antisniping_secs, min_bid, min_bid_difference)
                 VALUES ($1, 'scenario-5', 'ACTIVE', $2, $3, 0, 1, 0)",
            )
            .bind(auction_id)
            .bind(seller_id)
            .bind(seller_wallet_id)
            .execute(&*pool)
            .await?;

            let now = SystemTime::now();
            let start_time = now - Duration::from_secs(3600);
            let end_time = now - Duration::from_secs(60);

            sqlx::query(
                "INSERT INTO rounds
                    (auction_id, round_index, start_time, end_time, status, processing_status)
                 VALUES ($1, 0, $2, $3, 'ACTIVE', 'ACTIVE')",
            )
            .bind(auction_id)
            .bind(start_time)
            .bind(end_time)
            .execute(&*pool)
            .await?;

            let mut item_ids = Vec::new();
            for num in 0..3 {
                let item_id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO items (id, collection_name, num, value, owner_id)
                     VALUES ($1, 'scenario-5', $2, 0, $3)",
                )
                .bind(item_id)
                .bind(num)
                .bind(seller_id)
                .execute(&*pool)
                .await?;
                sqlx::query(
                    "INSERT INTO round_items (auction_id, round_index, item_id) VALUES ($1, 0, $2)",
                )
                .bind(auction_id)
                .bind(item_id)
                .execute(&*pool)
                .await?;
                item_ids.push(item_id);
            }

            let mut bidder_wallets = Vec::new();
            for amount in [100i64, 200, 300, 400] {
                let (user_id, wallet_id) = insert_user_and_wallet(&pool, 1000, amount).await?;
                sqlx::query(
                    "INSERT INTO bids (id, user_id, auction_id, amount, status)
                     VALUES ($1, $2, $3, $4, 'ACTIVE')",
                )
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind(auction_id)
                .bind(amount)
                .execute(&*pool)
                .await?;
                bidder_wallets.push((user_id, wallet_id, amount));
            }

            finalize_round_synchronously(&storage, auction_id, 0, now).await?;

            let (auction_status,): (String,) =
                sqlx::query_as("SELECT status FROM auctions WHERE id = $1")
                    .bind(auction_id)
                    .fetch_one(&*pool)
                    .await?;
            assert_eq!(auction_status, "ENDED");

            let (round_status, processing_status): (String, String) = sqlx::query_as(
                "SELECT status, processing_status FROM rounds WHERE auction_id = $1 AND round_index = 0",
            )
            .bind(auction_id)
            .fetch_one(&*pool)
            .await?;
            assert_eq!(round_status, "ENDED");
            assert_eq!(processing_status, "COMPLETED");

            let item_owners: Vec<Uuid> = {
                let mut owners = Vec::new();
                for item_id in &item_ids {
                    let (owner_id,): (Uuid,) =
                        sqlx::query_as("SELECT owner_id FROM items WHERE id = $1")
                            .bind(item_id)
                            .fetch_one(&*pool)
                            .await?;
                    owners.push(owner_id);
                }
                owners
            };
            let winner_ids: Vec<Uuid> = bidder_wallets
                .iter()
                .rev()
                .take(3)
                .map(|(user_id, ..)| *user_id)
                .collect();
            assert_eq!(item_owners, winner_ids);

            for (user_id, wallet_id, amount) in &bidder_wallets {
                let (balance, locked_balance): (i64, i64) = sqlx::query_as(
                    "SELECT balance, locked_balance FROM wallets WHERE id = $1",
                )
                .bind(wallet_id)
                .fetch_one(&*pool)
                .await?;

                if *amount == 100 {
                    assert_eq!(balance, 1000, "loser's balance must be untouched");
                    assert_eq!(locked_balance, 0, "loser's lock must be released");
                } else {
                    assert_eq!(balance, 1000 - amount, "winner {user_id} must pay");
                    assert_eq!(locked_balance, 0, "winner's lock must be released");
                }
            }

            let (seller_balance,): (i64,) =
                sqlx::query_as("SELECT balance FROM wallets WHERE id = $1")
                    .bind(seller_wallet_id)
                    .fetch_one(&*pool)
                    .await?;
            assert_eq!(seller_balance, 900);

            let bid_statuses: Vec<String> =
                sqlx::query_scalar("SELECT status FROM bids WHERE auction_id = $1 ORDER BY amount")
                    .bind(auction_id)
                    .fetch_all(&*pool)
                    .await?;
            assert_eq!(bid_statuses, vec!["LOST", "WON", "WON", "WON"]);

            Ok(())
        }

        /// Scenario 6 (spec §8): a redelivered `DETERMINE_WINNERS` stage message must not
        /// re-apply the stage — its guard on `processing_status` makes the second delivery a
        /// no-op, so winners are marked exactly once even if the consumer redelivers after a
        /// crash between commit and ack.
        #[tokio::test]
        async fn redelivered_determine_winners_stage_is_a_no_op() -> Result<(), Box<dyn StdError>> {
            let storage = start_storage().await?;
            let pool = storage.pool_for_test();

            let (seller_id, seller_wallet_id) = insert_user_and_wallet(&pool, 0, 0).await?;
            let auction_id = Uuid::new_v4();

            sqlx::query(
                "INSERT INTO auctions
                    (id, name, status, seller_id, seller_wallet_id,
                     antisniping_secs, min_bid, min_bid_difference)
                 VALUES ($1, 'scenario-6', 'ACTIVE', $2, $3, 0, 1, 0)",
            )
            .bind(auction_id)
            .bind(seller_id)
            .bind(seller_wallet_id)
            .execute(&*pool)
            .await?;

            let now = SystemTime::now();
            let start_time = now - Duration::from_secs(3600);
            let end_time = now - Duration::from_secs(60);

            sqlx::query(
                "INSERT INTO rounds
                    (auction_id, round_index, start_time, end_time, status, processing_status)
                 VALUES ($1, 0, $2, $3, 'ACTIVE', 'ACTIVE')",
            )
            .bind(auction_id)
            .bind(start_time)
            .bind(end_time)
            .execute(&*pool)
            .await?;

            let item_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO items (id, collection_name, num, value, owner_id) VALUES ($1, 'scenario-6', 0, 0, $2)",
            )
            .bind(item_id)
            .bind(seller_id)
            .execute(&*pool)
            .await?;
            sqlx::query("INSERT INTO round_items (auction_id, round_index, item_id) VALUES ($1, 0, $2)")
                .bind(auction_id)
                .bind(item_id)
                .execute(&*pool)
                .await?;

            let (winner_id, winner_wallet_id) = insert_user_and_wallet(&pool, 1000, 400).await?;
            sqlx::query(
                "INSERT INTO bids (id, user_id, auction_id, amount, status) VALUES ($1, $2, $3, 400, 'ACTIVE')",
            )
            .bind(Uuid::new_v4())
            .bind(winner_id)
            .bind(auction_id)
            .execute(&*pool)
            .await?;

            let apply_once = move |storage: PostgresStorage, auction: Auction, round: Round| async move {
                let mut tx = storage.begin().await?;
                apply_stage(&storage, &mut tx, &auction, &round, now, Stage::DetermineWinners).await?;
                storage.commit(tx).await?;
                Ok::<_, FinalizeError>(())
            };

            let load = move |storage: &PostgresStorage| async move {
                let mut tx = storage.begin().await?;
                let auction = storage
                    .load_auction(&mut tx, auction_id)
                    .await?
                    .expect("auction exists");
                storage.commit(tx).await?;
                Ok::<_, sqlx::Error>(auction)
            };

            let auction = load(&storage).await?;
            let round = auction.rounds[0].clone();
            apply_once(storage.clone(), auction, round).await?;

            let auction = load(&storage).await?;
            assert_eq!(auction.rounds[0].processing_status, ProcessingStatus::ProcessingWinners);

            // Redeliver the same stage message: the guard must make this a no-op.
            let round = auction.rounds[0].clone();
            apply_once(storage.clone(), auction, round).await?;

            let (status, won_round_index): (String, Option<i32>) = sqlx::query_as(
                "SELECT status, won_round_index FROM bids WHERE user_id = $1",
            )
            .bind(winner_id)
            .fetch_one(&*pool)
            .await?;
            assert_eq!(status, "WON");
            assert_eq!(won_round_index, Some(0));

            // A second mark-won would be harmless (idempotent UPDATE) anyway, but the guard
            // means we never even issue it — confirmed indirectly by the wallet being
            // untouched (DETERMINE_WINNERS never touches wallets; this just keeps the test
            // honest that we exercised the no-op path and not an error).
            let (locked_balance,): (i64,) =
                sqlx::query_as("SELECT locked_balance FROM wallets WHERE id = $1")
                    .bind(winner_wallet_id)
                    .fetch_one(&*pool)
                    .await?;
            assert_eq!(locked_balance, 400);

            Ok(())
        }
    }
}
