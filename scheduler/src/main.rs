// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

#[tokio::main]
async fn main() {
    use auction_common::telemetry;
    use log::error;
    use std::panic;

    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    use anyhow::Context;
    use auction_common::{
        config::ConfigExt,
        domain::clock::SystemClock,
        infra::{NatsBus, PostgresPool, migrations},
        telemetry,
    };
    use scheduler::{application, config::Config, infra};
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler can be registered");
    let config = Config::load().context("load configuration")?;
    log::info!(config:?; "starting scheduler");

    let Config {
        run_migrations,
        application_config,
        infra_config,
        telemetry_config:
            telemetry::Config {
                tracing_config,
                metrics_config,
            },
    } = config;

    telemetry::init_tracing(tracing_config);
    telemetry::init_metrics(metrics_config);

    let infra::Config {
        storage_config,
        bus_config,
    } = infra_config;

    let pool = PostgresPool::new(storage_config)
        .await
        .context("create DB pool for Postgres")?;

    if run_migrations {
        migrations::run(&pool).await.context("run migrations")?;
    }

    let bus = NatsBus::new(bus_config)
        .await
        .context("connect to NATS for the delayed message bus")?;
    let clock = SystemClock;

    application::run(application_config, pool, clock, bus, sigterm)
        .await
        .context("run scheduler application")
}
