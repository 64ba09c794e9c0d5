// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

pub mod consumer;
pub mod storage;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "storage")]
    pub storage_config: auction_common::infra::pool::Config,

    #[serde(rename = "lock")]
    pub lock_config: auction_common::infra::lock::Config,

    #[serde(rename = "bus")]
    pub bus_config: auction_common::infra::bus::Config,

    #[serde(rename = "consumer")]
    pub consumer_config: consumer::Config,
}
