// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::infra::pool::PostgresPool;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Run the database migrations for Postgres.
pub async fn run(pool: &PostgresPool) -> Result<(), Error> {
    sqlx::migrate!("migrations/postgres").run(&**pool).await?;
    Ok(())
}

/// Error possibly returned by [run].
#[derive(Debug, Error)]
#[error("cannot run migrations for postgres")]
pub struct Error(#[from] MigrateError);

#[cfg(test)]
mod tests {
    use crate::infra::{migrations::run, pool::{Config, PostgresPool, SslMode}};
    use anyhow::Context;
    use sqlx::Row;
    use std::{collections::HashSet, error::Error as StdError, time::Duration};
    use testcontainers::{ImageExt, runners::AsyncRunner};
    use testcontainers_modules::postgres::Postgres;

    #[tokio::test]
    async fn test_run() -> Result<(), Box<dyn StdError>> {
        let postgres_container = Postgres::default()
            .with_db_name("auction")
            .with_user("auction")
            .with_password("auction")
            .with_tag("17.1-alpine")
            .start()
            .await
            .context("start Postgres container")?;
        let postgres_port = postgres_container
            .get_host_port_ipv4(5432)
            .await
            .context("get Postgres port")?;

        let config = Config {
            host: "localhost".to_string(),
            port: postgres_port,
            dbname: "auction".to_string(),
            user: "auction".to_string(),
            password: "auction".to_string(),
            sslmode: SslMode::Prefer,
            max_connections: 10,
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(5 * 60),
        };
        let pool = PostgresPool::new(config).await?;

        let result = run(&pool).await;
        assert!(result.is_ok());

        let table_names = sqlx::query(
            "SELECT tablename
             FROM pg_catalog.pg_tables
             WHERE schemaname = 'public'",
        )
        .fetch_all(&*pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>(0))
        .collect::<HashSet<_>>();

        assert!(table_names.contains("auctions"));
        assert!(table_names.contains("bids"));

        Ok(())
    }
}
