// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod auction;
pub mod bid;
pub mod bus;
pub mod clock;
pub mod item;
pub mod lock;
pub mod transaction;
pub mod user;
pub mod wallet;

pub use auction::{Auction, AuctionSettings, AuctionStatus, ProcessingStatus, Round, RoundStatus};
pub use bid::{Bid, BidStatus, PlaceBidError};
pub use bus::{DelayedBus, Stage, StageMessage, TriggerMessage};
pub use clock::Clock;
pub use item::Item;
pub use lock::{DistributedLock, LockError, LockToken};
pub use transaction::{Transaction, TransactionType};
pub use user::User;
pub use wallet::Wallet;
