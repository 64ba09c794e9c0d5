// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::bus::{BusError, DelayedBus, Stage, StageMessage, TriggerMessage};
use async_nats::jetstream::{self, stream::RetentionPolicy};
use log::warn;
use serde::Deserialize;
use std::time::Duration;

pub const TRIGGER_SUBJECT: &str = "auction.trigger";
pub const STAGE_SUBJECT: &str = "auction.stage";
pub const TRIGGER_STREAM: &str = "AUCTION_TRIGGER";
pub const STAGE_STREAM: &str = "AUCTION_STAGE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,
}

/// `DelayedBus` backed by NATS JetStream. The `stage` stream is a plain work-queue: stage
/// continuations are never delayed, so they publish immediately. JetStream has no per-message
/// delay, so the `trigger` stream's delay is realized as an in-process
/// `tokio::time::sleep`-then-publish: the message is lost if the process crashes mid-sleep,
/// a gap the periodic scheduler sweep exists to cover.
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
}

impl NatsBus {
    pub async fn new(config: Config) -> Result<Self, BusError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|error| BusError::Unavailable(error.into()))?;
        let jetstream = jetstream::new(client);

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: TRIGGER_STREAM.to_string(),
                subjects: vec![TRIGGER_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|error| BusError::Unavailable(error.into()))?;

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: STAGE_STREAM.to_string(),
                subjects: vec![STAGE_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|error| BusError::Unavailable(error.into()))?;

        Ok(NatsBus { jetstream })
    }

    async fn publish_trigger_now(
        jetstream: &jetstream::Context,
        message: &TriggerMessage,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(message).map_err(|error| BusError::Publish(error.into()))?;

        jetstream
            .publish(TRIGGER_SUBJECT, payload.into())
            .await
            .map_err(|error| BusError::Publish(error.into()))?
            .await
            .map_err(|error| BusError::Publish(error.into()))?;

        Ok(())
    }
}

impl DelayedBus for NatsBus {
    async fn publish_trigger_delayed(
        &self,
        message: TriggerMessage,
        delay: Duration,
    ) -> Result<(), BusError> {
        if delay.is_zero() {
            return Self::publish_trigger_now(&self.jetstream, &message).await;
        }

        let jetstream = self.jetstream.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if let Err(error) = Self::publish_trigger_now(&jetstream, &message).await {
                warn!(
                    auction_id:% = message.auction_id, error:%;
                    "delayed trigger publish failed; relying on scheduler sweep"
                );
            }
        });

        Ok(())
    }

    async fn publish_stage(&self, message: StageMessage) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&message).map_err(|error| BusError::Publish(error.into()))?;

        self.jetstream
            .publish(STAGE_SUBJECT, payload.into())
            .await
            .map_err(|error| BusError::Publish(error.into()))?
            .await
            .map_err(|error| BusError::Publish(error.into()))?;

        Ok(())
    }
}

/// Parses the `stage` field on message redelivery failures for dead-letter logging.
pub fn describe_stage(stage: Stage) -> &'static str {
    match stage {
        Stage::DetermineWinners => "DETERMINE_WINNERS",
        Stage::TransferItems => "TRANSFER_ITEMS",
        Stage::ProcessPayments => "PROCESS_PAYMENTS",
        Stage::RefundLosers => "REFUND_LOSERS",
        Stage::Finalize => "FINALIZE",
    }
}
