// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
