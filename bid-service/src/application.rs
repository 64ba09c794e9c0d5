// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::{domain::storage::Storage, infra::api};
use anyhow::Context;
use auction_common::domain::{Clock, DelayedBus, DistributedLock};
use log::warn;
use tokio::{select, signal::unix::Signal, task};

/// Serves the bid placement API until SIGTERM, the teacher's standard process-lifecycle shape
/// (a handful of tasks raced with `select!` against SIGTERM; here there is exactly one task).
pub async fn run<S, L, C, B>(
    api_config: api::Config,
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
    let serve_api_task = task::spawn(async move {
        api::serve(api_config, storage, lock, clock, bus)
            .await
            .context("serving bid-service API")
    });

    select! {
        result = serve_api_task => result
            .context("serve_api_task panicked")
            .and_then(|r| r.context("serve_api_task failed")),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}
