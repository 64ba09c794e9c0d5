// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use auction_common::{
    domain::{Clock, DelayedBus},
    infra::{pool::PostgresPool, sweep},
};
use log::{info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::{select, signal::unix::Signal, time::sleep};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Runs the standalone liveness sweep on its own schedule, independent of the Finalizer's
/// embedded copy of the same task (`finalizer::application::run`'s `sweep_task`) — a deployment
/// may run either, both, or disable one, since duplicate triggers are harmless
/// (`auction_common::infra::sweep`).
pub async fn run<C, B>(
    config: Config,
    pool: PostgresPool,
    clock: C,
    bus: B,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    C: Clock,
    B: DelayedBus,
{
    let sweep_task = async move {
        loop {
            sleep(config.sweep_interval).await;

            match sweep::sweep_once(&pool, &bus, clock.now()).await {
                Ok(published) if published > 0 => {
                    info!(published; "scheduler sweep published triggers")
                }
                Ok(_) => {}
                Err(error) => warn!(error:%; "scheduler sweep failed, will retry next tick"),
            }
        }

        // `loop` above never breaks; this satisfies the task's `anyhow::Result<()>` type.
        Ok::<(), anyhow::Error>(())
    };

    select! {
        result = sweep_task => result.context("sweep task failed"),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
