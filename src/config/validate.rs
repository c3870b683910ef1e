//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.homeserver.url.is_empty() {
        errors.push("homeserver.url is required".to_string());
    }
    if config.homeserver.domain.is_empty() {
        errors.push("homeserver.domain is required".to_string());
    }
    if config.appservice.url.is_empty() {
        errors.push("appservice.url is required".to_string());
    }
    if config.appservice.token.is_empty() {
        errors.push("appservice.token is required".to_string());
    }
    if config.appservice.localpart.is_empty() {
        errors.push("appservice.localpart is required".to_string());
    }

    if !config.database_uri.starts_with("file://") && config.database_uri != "memory://" {
        errors.push(format!(
            "database_uri '{}' is invalid (use file://<dir> or memory://)",
            config.database_uri
        ));
    }

    if config.servers.is_empty() {
        errors.push("servers is empty - no IRC networks configured".to_string());
    }

    for (domain, server) in &config.servers {
        if server.port == 0 {
            errors.push(format!("servers.{}.port must be non-zero", domain));
        }
        if server.bot_config.nick.is_empty() {
            errors.push(format!("servers.{}.bot_config.nick is required", domain));
        }

        let user_template = &server.matrix_clients.user_template;
        if !user_template.starts_with('@') || !user_template.contains("$NICK") {
            errors.push(format!(
                "servers.{}.matrix_clients.user_template '{}' must start with '@' and contain $NICK",
                domain, user_template
            ));
        }

        let alias_template = &server.dynamic_channels.alias_template;
        if !alias_template.starts_with('#') || !alias_template.contains("$CHANNEL") {
            errors.push(format!(
                "servers.{}.dynamic_channels.alias_template '{}' must start with '#' and contain $CHANNEL",
                domain, alias_template
            ));
        }

        let nick_template = &server.irc_clients.nick_template;
        if !["$USERID", "$LOCALPART", "$DISPLAY"]
            .iter()
            .any(|var| nick_template.contains(var))
        {
            errors.push(format!(
                "servers.{}.irc_clients.nick_template '{}' must contain $USERID, $LOCALPART or $DISPLAY",
                domain, nick_template
            ));
        }

        for (channel, rooms) in &server.mappings {
            if !channel.starts_with('#') {
                errors.push(format!(
                    "servers.{}.mappings key '{}' is not a channel",
                    domain, channel
                ));
            }
            for room in rooms {
                if !room.starts_with('!') {
                    errors.push(format!(
                        "servers.{}.mappings.{} entry '{}' is not a room ID",
                        domain, channel, room
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
