// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod bus;
pub mod lock;
pub mod migrations;
pub mod pool;
pub mod sweep;

pub use bus::NatsBus;
pub use lock::RedisLock;
pub use pool::PostgresPool;
