//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `IRCBRIDGE_CONFIG` - Config file path
//! - `IRCBRIDGE_HOMESERVER_URL` - Homeserver base URL
//! - `IRCBRIDGE_AS_TOKEN` - Application service token
//! - `IRCBRIDGE_DATABASE_URI` - Document store URI
//! - `IRCBRIDGE_LISTEN_PORT` - Transaction listener port

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "IRCBRIDGE";

/// Apply environment variable overrides to a config.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(url) = env::var(format!("{}_HOMESERVER_URL", ENV_PREFIX)) {
        config.homeserver.url = url;
    }
    if let Ok(token) = env::var(format!("{}_AS_TOKEN", ENV_PREFIX)) {
        config.appservice.token = token;
    }
    if let Ok(uri) = env::var(format!("{}_DATABASE_URI", ENV_PREFIX)) {
        config.database_uri = uri;
    }
    if let Ok(port) = env::var(format!("{}_LISTEN_PORT", ENV_PREFIX)) {
        if let Ok(port) = port.parse() {
            config.appservice.port = port;
        }
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `IRCBRIDGE_CONFIG`, otherwise returns "ircbridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "ircbridge.conf".to_string())
}
