// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use derive_more::Display;
use log::warn;
use metrics::{counter, histogram};
use std::{future::Future, time::Duration, time::Instant};
use thiserror::Error;

/// Caller-generated unique identifier for the current holder of a lock (timestamp + random +
/// process id), per spec §4.1. Opaque to the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        use rand::Rng;

        let pid = std::process::id();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let random: u64 = rand::thread_rng().r#gen();

        LockToken(format!("{now:x}-{pid:x}-{random:x}"))
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// `acquire` exhausted its caller-specified maximum wait without success.
    #[error("timed out waiting to acquire lock {key}")]
    Timeout { key: String },

    /// The backing cache was unreachable; callers must surface this as a transient,
    /// retriable error (spec §4.1 failure semantics).
    #[error("distributed lock backing store unreachable")]
    Unavailable(#[source] anyhow::Error),
}

/// Serializes critical sections across horizontally scaled processes (spec §4.1). Not a
/// fencing token: callers whose critical section may outlive the TTL must validate
/// invariants post-hoc (here, via the enclosing database transaction).
#[trait_variant::make(Send)]
pub trait DistributedLock
where
    Self: Clone + Send + Sync + 'static,
{
    /// Writes `token` for `key` only if no entry currently exists, then re-reads to confirm
    /// the stored token is the caller's own (guards concurrent writers). Polls with
    /// exponential backoff (base 50ms, factor 1.5, cap 500ms, jitter +-25ms) until `max_wait`
    /// elapses.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<LockToken, LockError>;

    /// Deletes `key` only if its stored value still equals `token` (guards against releasing
    /// a lock stolen after TTL expiry). Returns `false` if the token no longer matched, i.e.
    /// the lock had already expired while held.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError>;
}

/// Acquires `key`, runs `f`, and releases even if `f` fails — the `withLock` convenience of
/// spec §4.1.
///
/// Spec §4.1's "expired-while-holding" failure mode (`release` finds the stored token no
/// longer matches) is surfaced here as a `lock_expired_while_held_total` counter and a warning
/// log rather than aborting `f`'s already-committed transaction: every caller's critical
/// section takes its row locks with `FOR UPDATE` inside that same transaction, so a second
/// process racing in after this lock's TTL lapsed blocks on Postgres until this transaction
/// commits or rolls back — the data can never be corrupted by the race, only serialized through
/// the database instead of through Redis. See DESIGN.md for the full writeup.
pub async fn with_lock<L, F, Fut, T, E>(
    lock: &L,
    key: &str,
    ttl: Duration,
    max_wait: Duration,
    f: F,
) -> Result<T, E>
where
    L: DistributedLock,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<LockError>,
{
    let key_prefix = key.split(':').next().unwrap_or(key).to_string();
    let started = Instant::now();
    let token = lock.acquire(key, ttl, max_wait).await?;
    histogram!("lock_wait_ms", "key_prefix" => key_prefix.clone())
        .record(started.elapsed().as_millis() as f64);

    let result = f().await;

    match lock.release(key, &token).await {
        Ok(true) => {}
        Ok(false) => {
            counter!("lock_expired_while_held_total", "key_prefix" => key_prefix).increment(1);
            warn!(key:%; "lock token no longer matched on release; TTL expired while held");
        }
        Err(error) => {
            warn!(key:%, error:%; "failed to release lock");
        }
    }

    result
}
