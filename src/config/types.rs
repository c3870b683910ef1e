//! Configuration type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub appservice: AppserviceConfig,
    #[serde(default = "default_database_uri")]
    pub database_uri: String,
    /// IRC networks keyed by domain. Ordered so the serialized form is stable.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// The homeserver this bridge registers with.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    pub url: String,
    pub domain: String,
}

/// Application service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AppserviceConfig {
    /// URL the homeserver uses to reach this bridge.
    pub url: String,
    /// Token this bridge presents to the homeserver.
    pub token: String,
    #[serde(default = "default_localpart")]
    pub localpart: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

/// Per-network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_irc_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub bot_config: BotConfig,
    #[serde(default)]
    pub private_messages: PrivateMessagesConfig,
    #[serde(default)]
    pub dynamic_channels: DynamicChannelsConfig,
    #[serde(default)]
    pub membership_lists: MembershipListsConfig,
    #[serde(default)]
    pub matrix_clients: MatrixClientsConfig,
    #[serde(default)]
    pub irc_clients: IrcClientsConfig,
    /// Static channel -> room ID mappings.
    #[serde(default)]
    pub mappings: BTreeMap<String, Vec<String>>,
}

/// The bridge's own presence on a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bot_nick")]
    pub nick: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub join_channels_if_no_users: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            nick: default_bot_nick(),
            password: None,
            join_channels_if_no_users: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivateMessagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PrivateMessagesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Who may join dynamically created rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinRule {
    Public,
    Invite,
}

/// Rules for rooms created on demand for channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicChannelsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub create_alias: bool,
    #[serde(default = "default_true")]
    pub published: bool,
    #[serde(default = "default_join_rule")]
    pub join_rule: JoinRule,
    /// User IDs allowed to join invite-only dynamic rooms.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Channels that must never be bridged.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_alias_template")]
    pub alias_template: String,
}

impl Default for DynamicChannelsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            create_alias: true,
            published: true,
            join_rule: default_join_rule(),
            whitelist: Vec::new(),
            exclude: Vec::new(),
            alias_template: default_alias_template(),
        }
    }
}

/// Whether initial and incremental membership changes are mirrored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKinds {
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMembershipConfig {
    #[serde(default)]
    pub irc_to_matrix: SyncKinds,
    #[serde(default)]
    pub matrix_to_irc: SyncKinds,
}

/// Override for a single room (room -> IRC direction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMembershipRule {
    pub room: String,
    #[serde(default)]
    pub matrix_to_irc: Option<SyncKinds>,
}

/// Override for a single channel (IRC -> room direction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMembershipRule {
    pub channel: String,
    #[serde(default)]
    pub irc_to_matrix: Option<SyncKinds>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipListsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub global: GlobalMembershipConfig,
    #[serde(default)]
    pub rooms: Vec<RoomMembershipRule>,
    #[serde(default)]
    pub channels: Vec<ChannelMembershipRule>,
}

/// How IRC users appear on the room side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixClientsConfig {
    #[serde(default = "default_user_template")]
    pub user_template: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
}

impl Default for MatrixClientsConfig {
    fn default() -> Self {
        Self {
            user_template: default_user_template(),
            display_name: default_display_name(),
        }
    }
}

/// How room users appear on IRC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrcClientsConfig {
    #[serde(default = "default_nick_template")]
    pub nick_template: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Seconds of inactivity before a virtual connection is dropped. Zero disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub allow_nick_changes: bool,
}

impl Default for IrcClientsConfig {
    fn default() -> Self {
        Self {
            nick_template: default_nick_template(),
            max_clients: default_max_clients(),
            idle_timeout: default_idle_timeout(),
            allow_nick_changes: false,
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_database_uri() -> String {
    "file://data".to_string()
}

fn default_localpart() -> String {
    "appservice-irc".to_string()
}

fn default_listen_port() -> u16 {
    9995
}

fn default_irc_port() -> u16 {
    6667
}

fn default_bot_nick() -> String {
    "appservicebot".to_string()
}

fn default_join_rule() -> JoinRule {
    JoinRule::Public
}

fn default_alias_template() -> String {
    "#irc_$SERVER_$CHANNEL".to_string()
}

fn default_user_template() -> String {
    "@$SERVER_$NICK".to_string()
}

fn default_display_name() -> String {
    "$NICK (IRC)".to_string()
}

fn default_nick_template() -> String {
    "M-$DISPLAY".to_string()
}

fn default_max_clients() -> usize {
    30
}

fn default_idle_timeout() -> u64 {
    172_800
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_irc_port(),
            ssl: false,
            bot_config: BotConfig::default(),
            private_messages: PrivateMessagesConfig::default(),
            dynamic_channels: DynamicChannelsConfig::default(),
            membership_lists: MembershipListsConfig::default(),
            matrix_clients: MatrixClientsConfig::default(),
            irc_clients: IrcClientsConfig::default(),
            mappings: BTreeMap::new(),
        }
    }
}
