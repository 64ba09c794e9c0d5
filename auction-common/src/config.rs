// This file is part of auction-core.
// SPDX-License-Identifier: Apache-2.0

//! Layered configuration loading shared by every binary crate.

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;

/// Default location of the base YAML config, overridable via `CONFIG_FILE`.
const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Loads a `T` by layering environment variables (prefix `APP_`, `__` as nesting
/// separator) over a YAML file, the way every binary in this workspace loads its
/// top-level `Config`.
pub trait ConfigExt: DeserializeOwned {
    fn load() -> Result<Self, figment::Error> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        Figment::new()
            .merge(Yaml::file(config_file))
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
    }
}

impl<T> ConfigExt for T where T: DeserializeOwned {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Nested {
        value: u32,
    }

    #[derive(Debug, Deserialize)]
    struct Example {
        nested: Nested,
    }

    #[test]
    fn load_merges_env_over_missing_file() {
        // SAFETY: single-threaded test, no concurrent env mutation.
        unsafe {
            std::env::set_var("CONFIG_FILE", "does-not-exist.yaml");
            std::env::set_var("APP_NESTED__VALUE", "7");
        }

        let config = Example::load().expect("config loads from env alone");
        assert_eq!(config.nested.value, 7);

        unsafe {
            std::env::remove_var("CONFIG_FILE");
            std::env::remove_var("APP_NESTED__VALUE");
        }
    }
}
