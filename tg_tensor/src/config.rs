//! Engine configuration.

use std::env;

/// Settings fixed at engine construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Force a backend by name instead of picking by priority.
    pub backend: Option<String>,
    /// Time every kernel and check float outputs for NaN.
    pub debug: bool,
    /// In debug mode, fail a kernel whose output contains NaN.
    pub fail_on_nan: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `TG_BACKEND`, `TG_DEBUG` and `TG_FAIL_ON_NAN`.
    pub fn from_env() -> Self {
        EngineConfig {
            backend: env::var("TG_BACKEND").ok().filter(|s| !s.is_empty()),
            debug: env_flag("TG_DEBUG"),
            fail_on_nan: env_flag("TG_FAIL_ON_NAN"),
        }
    }

    pub fn with_backend(mut self, name: &str) -> Self {
        self.backend = Some(name.to_string());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_fail_on_nan(mut self, fail: bool) -> Self {
        self.fail_on_nan = fail;
        self
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
