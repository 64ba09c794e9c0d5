// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

//! NATS JetStream pull consumers for the `trigger` and `stage` streams (spec §4.5/§6):
//! acknowledge only on success, requeue (negative-ack, bounded retries) on a retriable
//! failure, and dead-letter (negative-ack without redelivery) on a `DataIntegrity` failure.

use crate::domain::{FinalizeError, Storage, on_stage, on_trigger};
use auction_common::{
    domain::{Clock, DelayedBus, DistributedLock, Stage, StageMessage, TriggerMessage},
    infra::bus::{STAGE_STREAM, STAGE_SUBJECT, TRIGGER_STREAM, TRIGGER_SUBJECT, describe_stage},
};
use async_nats::jetstream::{
    self, AckKind,
    consumer::{DeliverPolicy, pull::Config as PullConfig},
};
use fastrace::trace;
use futures::StreamExt;
use log::{error, warn};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const QUEUE_DELAY_WARNING_DEFAULT: Duration = Duration::from_secs(5);
/// Bounded per-message redelivery budget before a retriable failure is dead-lettered anyway,
/// so a permanently-broken dependency cannot wedge a stream forever.
const MAX_DELIVERIES: i64 = 20;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("cannot connect to NATS for consuming")]
    Connect(#[source] anyhow::Error),

    #[error("cannot create or bind consumer")]
    Bind(#[source] anyhow::Error),

    #[error("consumer message stream failed")]
    Stream(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,

    #[serde(with = "humantime_serde", default = "default_queue_delay_warning")]
    pub queue_delay_warning: Duration,
}

fn default_queue_delay_warning() -> Duration {
    QUEUE_DELAY_WARNING_DEFAULT
}

/// Runs the `trigger.q` consumer loop until cancelled: each message drives [on_trigger].
pub async fn run_trigger_consumer<S, L, C, B>(
    config: Config,
    storage: S,
    lock: L,
    clock: C,
    bus: B,
) -> Result<(), ConsumerError>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let jetstream = connect(&config.url).await?;
    let consumer = bind_pull_consumer(&jetstream, TRIGGER_STREAM, TRIGGER_SUBJECT, "finalizer-trigger").await?;

    let mut messages = consumer
        .messages()
        .await
        .map_err(|error| ConsumerError::Stream(error.into()))?;

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                warn!(error:%; "trigger consumer stream error, continuing");
                continue;
            }
        };

        let Some(trigger) = decode::<TriggerMessage>(&message.payload, config.queue_delay_warning, "trigger")
        else {
            let _ = message.ack_with(AckKind::Term).await;
            continue;
        };

        let result = on_trigger(&storage, &lock, &clock, &bus, trigger.auction_id)
            .await
            .map_err(|error| {
                error!(auction_id:% = trigger.auction_id, error:%; "on_trigger failed");
                error
            });

        ack_for_result(&message, result).await;
    }

    Ok(())
}

/// Runs the `stage.q` consumer loop until cancelled: each message drives [on_stage].
pub async fn run_stage_consumer<S, L, C, B>(
    config: Config,
    storage: S,
    lock: L,
    clock: C,
    bus: B,
) -> Result<(), ConsumerError>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let jetstream = connect(&config.url).await?;
    let consumer = bind_pull_consumer(&jetstream, STAGE_STREAM, STAGE_SUBJECT, "finalizer-stage").await?;

    let mut messages = consumer
        .messages()
        .await
        .map_err(|error| ConsumerError::Stream(error.into()))?;

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                warn!(error:%; "stage consumer stream error, continuing");
                continue;
            }
        };

        let Some(stage_message) =
            decode::<StageMessage>(&message.payload, config.queue_delay_warning, "stage")
        else {
            let _ = message.ack_with(AckKind::Term).await;
            continue;
        };

        let StageMessage {
            auction_id,
            round_index,
            stage,
            ..
        } = stage_message;

        let result = on_stage(&storage, &lock, &clock, &bus, auction_id, round_index, stage)
            .await
            .map_err(|error| {
                error!(
                    auction_id:%, round_index, stage = describe_stage(stage); "on_stage failed: {error}"
                );
                error
            });

        ack_for_result(&message, result).await;
    }

    Ok(())
}

#[trace]
async fn connect(url: &str) -> Result<jetstream::Context, ConsumerError> {
    let client = async_nats::connect(url)
        .await
        .map_err(|error| ConsumerError::Connect(error.into()))?;
    Ok(jetstream::new(client))
}

async fn bind_pull_consumer(
    jetstream: &jetstream::Context,
    stream_name: &str,
    subject: &str,
    durable_name: &str,
) -> Result<jetstream::consumer::PullConsumer, ConsumerError> {
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: stream_name.to_string(),
            subjects: vec![subject.to_string()],
            ..Default::default()
        })
        .await
        .map_err(|error| ConsumerError::Bind(error.into()))?;

    stream
        .get_or_create_consumer(
            durable_name,
            PullConfig {
                durable_name: Some(durable_name.to_string()),
                deliver_policy: DeliverPolicy::All,
                max_deliver: MAX_DELIVERIES,
                ..Default::default()
            },
        )
        .await
        .map_err(|error| ConsumerError::Bind(error.into()))
}

fn decode<T>(payload: &[u8], queue_delay_warning: Duration, kind: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned + MessagePublishedAt,
{
    let message: T = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(error) => {
            error!(error:%, kind; "cannot deserialize {kind} message; dead-lettering");
            return None;
        }
    };

    if let Ok(delay) = SystemTime::now().duration_since(message.published_at())
        && delay > queue_delay_warning
    {
        let delay_ms = delay.as_millis();
        warn!(delay_ms, kind; "{kind} message exceeded queue delay warning threshold");
    }

    Some(message)
}

trait MessagePublishedAt {
    fn published_at(&self) -> SystemTime;
}

impl MessagePublishedAt for TriggerMessage {
    fn published_at(&self) -> SystemTime {
        self.published_at
    }
}

impl MessagePublishedAt for StageMessage {
    fn published_at(&self) -> SystemTime {
        self.published_at
    }
}

/// Acks on success; on failure, dead-letters `DataIntegrity` (non-retriable) and requeues
/// everything else (spec §7 propagation policy).
async fn ack_for_result(message: &jetstream::Message, result: Result<(), FinalizeError>) {
    let outcome = match result {
        Ok(()) => AckKind::Ack,
        Err(error) if error.is_retriable() => AckKind::Nak(None),
        Err(FinalizeError::DataIntegrity(_)) => AckKind::Term,
        Err(_) => AckKind::Term,
    };

    if let Err(error) = message.ack_with(outcome).await {
        warn!(error:%; "failed to ack/nak message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_kind_for_data_integrity_is_terminal() {
        let error = FinalizeError::DataIntegrity("missing round".to_string());
        assert!(!error.is_retriable());
    }
}
