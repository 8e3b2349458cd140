// crates/lochness-config/tests/common/mod.rs
// ============================================================================
// Module: Config Test Helpers
// Description: Shared helpers for config validation tests.
// Purpose: Parse configs against a fixed environment map.
// ============================================================================

#![allow(
    dead_code,
    clippy::panic,
    reason = "Test helpers are selectively used across suites."
)]

use std::collections::BTreeMap;

use lochness_config::ConfigError;
use lochness_config::LochnessConfig;

/// Fixed environment for a test.
#[derive(Default)]
pub struct FakeEnv(pub BTreeMap<String, String>);

impl FakeEnv {
    /// Adds one variable.
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    /// Looks up one variable.
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Parses `toml` with an empty environment.
pub fn parse(toml: &str) -> Result<LochnessConfig, ConfigError> {
    parse_with(toml, &FakeEnv::default())
}

/// Parses `toml` against `env`.
pub fn parse_with(toml: &str, env: &FakeEnv) -> Result<LochnessConfig, ConfigError> {
    LochnessConfig::from_toml_with_env(toml, &|name| env.lookup(name))
}

/// Asserts that `result` is an error whose message contains `needle`.
pub fn assert_invalid<T>(result: Result<T, ConfigError>, needle: &str) {
    match result {
        Err(error) => {
            let message = error.to_string();
            assert!(message.contains(needle), "error {message} did not contain {needle}");
        }
        Ok(_) => panic!("expected invalid config containing {needle}"),
    }
}
