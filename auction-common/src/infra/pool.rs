// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::{ops::Deref, time::Duration};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub sslmode: SslMode,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Prefer,
    Disable,
    Require,
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Require => PgSslMode::Require,
        }
    }
}

/// Thin wrapper around `sqlx::PgPool`, configured and constructed the same way for every
/// binary crate.
#[derive(Debug, Clone)]
pub struct PostgresPool(sqlx::PgPool);

impl PostgresPool {
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let Config {
            host,
            port,
            dbname,
            user,
            password,
            sslmode,
            max_connections,
            idle_timeout,
            max_lifetime,
        } = config;

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&dbname)
            .username(&user)
            .password(&password)
            .ssl_mode(sslmode.into());

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(idle_timeout)
            .max_lifetime(max_lifetime)
            .connect_with(options)
            .await?;

        Ok(PostgresPool(pool))
    }
}

impl Deref for PostgresPool {
    type Target = sqlx::PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
