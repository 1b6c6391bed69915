// src/common/dev_mode.rs
//! Development mode configuration
//!
//! When enabled, a plain `x-user-id` request header is accepted as an
//! identity fallback so local clients can skip the provider round-trip.
//! The flag can never be on in production builds of the config.

use std::env;

use super::state::Environment;

/// Header honored as an identity source when dev mode is enabled.
pub const DEV_USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub struct DevModeConfig {
    enabled: bool,
}

impl DevModeConfig {
    /// Read DEV_MODE from the environment. Production environments force
    /// the flag off regardless of what DEV_MODE says.
    pub fn from_env(environment: Environment) -> Self {
        let requested = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        Self {
            enabled: requested && environment != Environment::Production,
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    #[cfg(test)]
    pub fn enabled_for_tests() -> Self {
        Self { enabled: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Print dev mode status on startup
pub fn print_dev_mode_status(config: &DevModeConfig) {
    if config.is_enabled() {
        println!("⚠️  DEV MODE ENABLED: `{}` header accepted as identity", DEV_USER_ID_HEADER);
        println!("   DO NOT USE IN PRODUCTION");
    } else {
        println!("🔒 Bearer-token authentication required");
    }
}
