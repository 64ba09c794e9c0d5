// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod pipeline;
pub mod storage;

pub use pipeline::{FinalizeError, finalize_round_synchronously, on_stage, on_trigger};
pub use storage::Storage;
