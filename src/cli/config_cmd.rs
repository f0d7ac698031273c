// Copyright 2024-2026 GG-CORE Contributors
// SPDX-License-Identifier: Apache-2.0

//! Config CLI subcommands: show, defaults.

use crate::cli::{EXIT_FAILURE, EXIT_OK};
use crate::config::FactoryConfig;

/// Print the effective configuration (environment applied) as TOML.
pub fn run_show() -> i32 {
    print_config(&FactoryConfig::from_env())
}

/// Print the built-in defaults as TOML.
pub fn run_defaults() -> i32 {
    print_config(&FactoryConfig::default())
}

fn print_config(config: &FactoryConfig) -> i32 {
    match toml::to_string_pretty(config) {
        Ok(text) => {
            print!("{}", text);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Error encoding configuration: {}", e);
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let config = FactoryConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: FactoryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(run_defaults(), EXIT_OK);
    }
}
