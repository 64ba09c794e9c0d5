// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::infra;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run_migrations: bool,

    #[serde(rename = "infra")]
    pub infra_config: infra::Config,

    #[serde(rename = "telemetry")]
    pub telemetry_config: auction_common::telemetry::Config,
}
