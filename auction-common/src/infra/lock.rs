// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::domain::lock::{DistributedLock, LockError, LockToken};
use rand::Rng;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub url: String,
}

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_millis(500);
const BACKOFF_JITTER: Duration = Duration::from_millis(25);

/// Compare-and-delete: releases `key` only if its stored value still equals the caller's
/// token, guarding against releasing a lock that has since been stolen after TTL expiry.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// `DistributedLock` backed by a single Redis instance (standard Redlock single-node idiom:
/// `SET NX PX` for acquisition, a Lua compare-and-delete for release).
#[derive(Clone)]
pub struct RedisLock {
    connection: ConnectionManager,
}

impl RedisLock {
    pub async fn new(config: Config) -> Result<Self, LockError> {
        let client = redis::Client::open(config.url)
            .map_err(|error| LockError::Unavailable(error.into()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|error| LockError::Unavailable(error.into()))?;

        Ok(RedisLock { connection })
    }

    fn backoff_sequence() -> impl Iterator<Item = Duration> {
        let mut delay = BACKOFF_BASE;

        std::iter::from_fn(move || {
            let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER.as_millis() as u64);
            let next = delay.saturating_add(Duration::from_millis(jitter));
            delay = (delay.mul_f64(BACKOFF_FACTOR)).min(BACKOFF_CAP);
            Some(next)
        })
    }
}

impl DistributedLock for RedisLock {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut connection = self.connection.clone();
        let mut backoffs = Self::backoff_sequence();

        loop {
            let set: Option<String> = connection
                .set_options(
                    key,
                    token.0.clone(),
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as usize)),
                )
                .await
                .map_err(|error| LockError::Unavailable(error.into()))?;

            if set.is_some() {
                return Ok(token);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                });
            }

            let delay = backoffs.next().unwrap_or(BACKOFF_CAP);
            sleep(delay.min(deadline.saturating_duration_since(tokio::time::Instant::now())))
                .await;
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut connection = self.connection.clone();

        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(&token.0)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| LockError::Unavailable(error.into()))?;

        Ok(deleted == 1)
    }
}
