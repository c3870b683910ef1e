//! Seams between a virtual connection and the IRC wire.
//!
//! `IrcConnector` opens connections, `IrcWire` is one registered connection,
//! and `NameService` picks the nick/username/realname to register with.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::common::error::BridgeResult;
use crate::common::types::{LocalIdentity, RemoteIdentity};

/// Reply codes that mean a JOIN will never succeed.
pub const JOIN_FAIL_CODES: [&str; 6] = [
    "err_nosuchchannel",
    "err_toomanychannels",
    "err_channelisfull",
    "err_inviteonlychan",
    "err_bannedfromchan",
    "err_badchannelkey",
];

/// Reply codes that mean a NICK was refused.
pub const NICK_FAIL_CODES: [&str; 4] = [
    "err_nonicknamegiven",
    "err_erroneusnickname",
    "err_nicknameinuse",
    "err_nickcollision",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Privmsg,
    Action,
    Notice,
    Topic,
}

/// Events observed on a wire connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Registration finished (001). The server may have picked another nick.
    Registered { nick: String },
    NickChanged { old: String, new: String },
    Joined { channel: String, nick: String },
    Parted {
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    /// Error reply; `command` is the lower-case mnemonic, `args` the params.
    Error { command: String, args: Vec<String> },
    Message {
        from: String,
        target: String,
        text: String,
        kind: MessageKind,
    },
    Mode {
        channel: String,
        by: String,
        mode: String,
        arg: Option<String>,
    },
    Disconnected { reason: String },
}

/// Result of a WHOIS query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoisInfo {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub server: Option<String>,
    pub channels: Vec<String>,
}

/// Parameters for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub domain: String,
    pub port: u16,
    pub ssl: bool,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub password: Option<String>,
}

/// One registered IRC connection.
#[async_trait]
pub trait IrcWire: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<WireEvent>;

    async fn join(&self, channel: &str) -> BridgeResult<()>;
    async fn part(&self, channel: &str, reason: &str) -> BridgeResult<()>;
    async fn say(&self, target: &str, text: &str) -> BridgeResult<()>;
    async fn action(&self, target: &str, text: &str) -> BridgeResult<()>;
    async fn notice(&self, target: &str, text: &str) -> BridgeResult<()>;
    async fn topic(&self, channel: &str, topic: &str) -> BridgeResult<()>;
    async fn nick(&self, nick: &str) -> BridgeResult<()>;
    /// `Ok(None)` when the server has no such nick.
    async fn whois(&self, nick: &str) -> BridgeResult<Option<WhoisInfo>>;
    async fn quit(&self, reason: &str) -> BridgeResult<()>;

    fn current_nick(&self) -> String;
    /// Whether the server has confirmed us in `channel`.
    fn is_joined(&self, channel: &str) -> bool;
    /// NICKLEN advertised by the server, if any.
    fn nick_max_len(&self) -> Option<usize>;
}

/// Opens wire connections.
#[async_trait]
pub trait IrcConnector: Send + Sync {
    /// Connect and wait for registration.
    async fn connect(&self, options: ConnectOptions) -> BridgeResult<Arc<dyn IrcWire>>;
}

/// Names to register a connection with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcNames {
    pub nick: String,
    pub username: String,
    pub realname: String,
}

/// Chooses the names a connection registers with.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn resolve(
        &self,
        identity: &LocalIdentity,
        owner: Option<&RemoteIdentity>,
    ) -> BridgeResult<IrcNames>;
}
