//! Shared types used across the application.

use serde::{Deserialize, Serialize};

/// Lower-case an IRC name using RFC 1459 casemapping.
///
/// `[]\~` are the lower-case forms of `{}|^`.
pub fn to_irc_lower(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// A user on the room-based network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl RemoteIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// The user ID without the sigil and server part (`@alice:hs` -> `alice`).
    pub fn localpart(&self) -> &str {
        let id = self.user_id.strip_prefix('@').unwrap_or(&self.user_id);
        id.split(':').next().unwrap_or(id)
    }
}

/// An identity on an IRC network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub domain: String,
    pub nick: String,
    pub password: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl LocalIdentity {
    pub fn new(domain: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            nick: nick.into(),
            password: None,
            username: None,
            is_bot: false,
        }
    }

    pub fn bot(domain: impl Into<String>, nick: impl Into<String>, password: Option<String>) -> Self {
        Self {
            password,
            is_bot: true,
            ..Self::new(domain, nick)
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

impl std::fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.nick, self.domain)
    }
}

/// A room on the room-based network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRoom {
    pub room_id: String,
}

impl RemoteRoom {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }
}

/// A channel (or PM target nick) on an IRC network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalRoom {
    pub domain: String,
    pub channel: String,
}

impl LocalRoom {
    pub fn new(domain: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            channel: channel.into(),
        }
    }

    /// Group channels start with `#`; anything else is a PM target.
    pub fn is_channel(&self) -> bool {
        is_channel_name(&self.channel)
    }

    /// Key used to persist this room: lower-cased channel, then the domain.
    pub fn store_id(&self) -> String {
        format!("{} {}", to_irc_lower(&self.channel), self.domain)
    }
}

pub fn is_channel_name(name: &str) -> bool {
    name.starts_with('#')
}

/// Kind-specific metadata carried by a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkData {
    Channel {
        from_config: bool,
    },
    Pm {
        real_user_id: String,
        virtual_user_id: String,
    },
    Admin {
        owner_id: String,
    },
}

impl LinkData {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkData::Channel { .. } => "channel",
            LinkData::Pm { .. } => "pm",
            LinkData::Admin { .. } => "admin",
        }
    }
}

/// Persistent association between a room-based room and an IRC room.
///
/// Admin links have no IRC side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub remote_id: String,
    pub local: Option<LocalRoom>,
    pub data: LinkData,
}

/// Which side an inbound event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    /// The room-based network (homeserver transaction).
    Remote,
    /// An IRC network.
    Local,
}

impl std::fmt::Display for RequestOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestOrigin::Remote => write!(f, "remote"),
            RequestOrigin::Local => write!(f, "irc"),
        }
    }
}
