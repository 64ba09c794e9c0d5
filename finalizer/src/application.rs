// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::{domain::storage::Storage, infra::consumer};
use anyhow::Context;
use auction_common::{
    domain::{Clock, DelayedBus, DistributedLock},
    infra::{pool::PostgresPool, sweep},
};
use log::{info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::{select, signal::unix::Signal, task, time::sleep};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub scheduler_interval: Duration,
}

/// Races the trigger consumer, the stage consumer and the embedded liveness sweep against
/// SIGTERM — the teacher's canonical process-lifecycle shape (`chain-indexer::application::run`),
/// generalized from two raced tasks to three (the Scheduler shares this process per
/// `SPEC_FULL.md`'s crate-layout rationale; the standalone `scheduler` binary runs the same
/// sweep independently for deployments that want to scale or disable it on its own).
pub async fn run<S, L, C, B>(
    config: Config,
    consumer_config: consumer::Config,
    pool: PostgresPool,
    storage: S,
    lock: L,
    clock: C,
    bus: B,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    S: Storage,
    L: DistributedLock,
    C: Clock,
    B: DelayedBus,
{
    let trigger_consumer_task = task::spawn({
        let consumer_config = consumer_config.clone();
        let storage = storage.clone();
        let lock = lock.clone();
        let clock = clock.clone();
        let bus = bus.clone();

        async move {
            consumer::run_trigger_consumer(consumer_config, storage, lock, clock, bus)
                .await
                .context("trigger consumer failed")
        }
    });

    let stage_consumer_task = task::spawn({
        let storage = storage.clone();
        let lock = lock.clone();
        let clock = clock.clone();
        let bus = bus.clone();

        async move {
            consumer::run_stage_consumer(consumer_config, storage, lock, clock, bus)
                .await
                .context("stage consumer failed")
        }
    });

    let sweep_task = task::spawn({
        let interval = config.scheduler_interval;
        let clock = clock.clone();
        let bus = bus.clone();

        async move {
            loop {
                sleep(interval).await;

                match sweep::sweep_once(&pool, &bus, clock.now()).await {
                    Ok(published) if published > 0 => {
                        info!(published; "finalizer embedded sweep published triggers")
                    }
                    Ok(_) => {}
                    Err(error) => warn!(error:%; "finalizer embedded sweep failed, will retry next tick"),
                }
            }

            // `loop` above never breaks; this satisfies the task's `anyhow::Result<()>` type.
            Ok::<(), anyhow::Error>(())
        }
    });

    select! {
        result = trigger_consumer_task => result
            .context("trigger_consumer_task panicked")
            .and_then(|r| r.context("trigger_consumer_task failed")),

        result = stage_consumer_task => result
            .context("stage_consumer_task panicked")
            .and_then(|r| r.context("stage_consumer_task failed")),

        result = sweep_task => result
            .context("sweep_task panicked")
            .and_then(|r| r.context("sweep_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
