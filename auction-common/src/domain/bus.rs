// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use uuid::Uuid;

/// One of the five discrete steps in round finalization, persisted in `processing_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    DetermineWinners,
    TransferItems,
    ProcessPayments,
    RefundLosers,
    Finalize,
}

impl Stage {
    /// The stage that follows a successful commit of `self`, given whether this round is the
    /// auction's last (spec §4.3 transition table).
    pub fn next(self, is_last_round: bool) -> Option<Stage> {
        match self {
            Stage::DetermineWinners => Some(Stage::TransferItems),
            Stage::TransferItems => Some(Stage::ProcessPayments),
            Stage::ProcessPayments if is_last_round => Some(Stage::RefundLosers),
            Stage::ProcessPayments => Some(Stage::Finalize),
            Stage::RefundLosers => Some(Stage::Finalize),
            Stage::Finalize => None,
        }
    }
}

/// A round-end trigger, delivered no earlier than `published_at + delay`. Round-end triggers
/// are the only delayed messages in the system; stage continuations publish immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub published_at: SystemTime,
}

/// A stage continuation, published immediately after the prior stage's transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMessage {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub round_index: i32,
    pub stage: Stage,
    pub published_at: SystemTime,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("delayed message bus unreachable")]
    Unavailable(#[source] anyhow::Error),

    #[error("failed to publish message")]
    Publish(#[source] anyhow::Error),
}

/// Durable queue supporting per-message scheduled delivery, spec §2/§4.5/§6. Two logical
/// streams, `trigger` and `stage`.
#[trait_variant::make(Send)]
pub trait DelayedBus
where
    Self: Clone + Send + Sync + 'static,
{
    /// Publishes to the `trigger` stream no earlier than `delay` from now.
    async fn publish_trigger_delayed(
        &self,
        message: TriggerMessage,
        delay: Duration,
    ) -> Result<(), BusError>;

    /// Publishes to the `stage` stream immediately.
    async fn publish_stage(&self, message: StageMessage) -> Result<(), BusError>;
}
