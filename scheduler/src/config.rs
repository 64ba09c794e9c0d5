// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

use crate::{application, infra};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run_migrations: bool,

    #[serde(rename = "application")]
    pub application_config: application::Config,

    #[serde(rename = "infra")]
    pub infra_config: infra::Config,

    #[serde(rename = "telemetry")]
    pub telemetry_config: auction_common::telemetry::Config,
}
