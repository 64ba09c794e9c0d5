// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

//! The liveness-sweep query and publish step shared by the Finalizer's embedded periodic task
//! and the standalone Scheduler binary (spec §4.4): find auctions with an ACTIVE round whose
//! `end_time` has passed, and (re-)publish a zero-delay `trigger` message for each. Duplicate
//! triggers are harmless; the Finalizer's `onTrigger` precondition checks make this idempotent.

use crate::{
    domain::bus::{BusError, DelayedBus, TriggerMessage},
    infra::pool::PostgresPool,
};
use indoc::indoc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to query due auctions")]
    Query(#[from] sqlx::Error),

    #[error("failed to publish trigger")]
    Publish(#[from] BusError),
}

/// Auction ids with at least one round that is `status = 'ACTIVE'` and `end_time < now`,
/// while the auction itself is still `status = 'ACTIVE'`.
pub async fn due_auction_ids(pool: &PostgresPool, now: SystemTime) -> Result<Vec<Uuid>, sqlx::Error> {
    let query = indoc! {"
        SELECT DISTINCT a.id
        FROM auctions a
        JOIN rounds r ON r.auction_id = a.id
        WHERE a.status = 'ACTIVE' AND r.status = 'ACTIVE' AND r.end_time < $1
    "};

    sqlx::query_scalar::<_, Uuid>(query)
        .bind(now)
        .fetch_all(&**pool)
        .await
}

/// Runs one sweep tick: queries due auctions and publishes a zero-delay trigger for each.
/// Returns the number of triggers published.
pub async fn sweep_once<B>(pool: &PostgresPool, bus: &B, now: SystemTime) -> Result<usize, SweepError>
where
    B: DelayedBus,
{
    let auction_ids = due_auction_ids(pool, now).await?;

    for auction_id in &auction_ids {
        let message = TriggerMessage {
            id: Uuid::new_v4(),
            auction_id: *auction_id,
            published_at: now,
        };
        bus.publish_trigger_delayed(message, Duration::ZERO).await?;
    }

    Ok(auction_ids.len())
}
