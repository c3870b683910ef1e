//! Homeserver token and application service registration.
//!
//! The homeserver token carries a CRC32 of the network configuration
//! (`<random>_crc<hex>`). At startup the live configuration is checksummed
//! again; a mismatch means the configuration changed without a new
//! registration being handed to the homeserver.

use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::common::error::{BridgeError, BridgeResult};
use crate::config::types::Config;
use crate::irc::server::{escape_regex, ServerPolicy};

/// File the registration is written to.
pub const REGISTRATION_FILE: &str = "appservice-registration-irc.yaml";

const CRC_MARKER: &str = "_crc";

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// CRC32 of the serialized network configuration, lower-case hex.
pub fn servers_checksum(config: &Config) -> BridgeResult<String> {
    let serialized = serde_json::to_string(&config.servers)
        .map_err(|e| BridgeError::Store(e.to_string()))?;
    Ok(format!("{:x}", crc32fast::hash(serialized.as_bytes())))
}

pub fn create_hs_token(config: &Config) -> BridgeResult<String> {
    Ok(format!(
        "{}{}{}",
        random_hex(32),
        CRC_MARKER,
        servers_checksum(config)?
    ))
}

/// Check a stored token against the live configuration.
///
/// Tokens without a checksum predate the check and are accepted.
pub fn check_hs_token(stored: &str, config: &Config) -> BridgeResult<()> {
    let computed = servers_checksum(config)?;
    let Some(stored_checksum) = stored.split(CRC_MARKER).nth(1).filter(|c| !c.is_empty()) else {
        warn!("Stored token does not have a CRC");
        return Ok(());
    };
    if stored_checksum != computed {
        error!("CRC Failure: {} != {}", computed, stored_checksum);
        return Err(BridgeError::ConfigDrift {
            token: stored.to_string(),
            stored: stored_checksum.to_string(),
            computed,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexPattern {
    pub regex: String,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub users: Vec<RegexPattern>,
    pub aliases: Vec<RegexPattern>,
    pub rooms: Vec<RegexPattern>,
}

/// Registration handed to the homeserver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    pub namespaces: Namespaces,
}

impl Registration {
    pub fn new(config: &Config, hs_token: String) -> Self {
        Self {
            id: random_hex(16),
            url: config.appservice.url.clone(),
            as_token: config.appservice.token.clone(),
            hs_token,
            sender_localpart: config.appservice.localpart.clone(),
            namespaces: Namespaces::default(),
        }
    }

    /// Claim the configured rooms (shared) and each network's users, plus its
    /// aliases when it creates them (exclusive).
    pub fn add_patterns<'a>(
        &mut self,
        config_rooms: &[String],
        servers: impl IntoIterator<Item = &'a ServerPolicy>,
    ) {
        for room_id in config_rooms {
            self.namespaces.rooms.push(RegexPattern {
                regex: escape_regex(room_id),
                exclusive: false,
            });
        }
        for server in servers {
            if server.creates_dynamic_aliases() {
                self.namespaces.aliases.push(RegexPattern {
                    regex: server.alias_regex(),
                    exclusive: true,
                });
            }
            self.namespaces.users.push(RegexPattern {
                regex: server.user_regex(),
                exclusive: true,
            });
        }
    }

    /// Write as JSON, which every YAML reader accepts.
    pub async fn write(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, body).await
    }
}
