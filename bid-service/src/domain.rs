// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod bid_placement;
pub mod storage;

pub use bid_placement::{PlaceBidOutcome, place_bid};
pub use storage::Storage;
