//! Canonical message types for bridge communication.
//!
//! This module defines the neutral actions exchanged between the room-based
//! network and IRC, and the inbound events that produce them.

use serde::Deserialize;

use crate::common::error::{BridgeError, BridgeResult};

/// What a bridged action does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Message,
    Emote,
    Notice,
    Topic,
    Image,
    File,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Message => "message",
            ActionKind::Emote => "emote",
            ActionKind::Notice => "notice",
            ActionKind::Topic => "topic",
            ActionKind::Image => "image",
            ActionKind::File => "file",
        }
    }

    /// Parse an action kind name.
    pub fn parse(kind: &str) -> BridgeResult<Self> {
        match kind {
            "message" => Ok(ActionKind::Message),
            "emote" => Ok(ActionKind::Emote),
            "notice" => Ok(ActionKind::Notice),
            "topic" => Ok(ActionKind::Topic),
            "image" => Ok(ActionKind::Image),
            "file" => Ok(ActionKind::File),
            other => Err(BridgeError::UnknownActionKind {
                kind: other.to_string(),
            }),
        }
    }

    /// Map a room message `msgtype` to an action kind.
    pub fn from_msgtype(msgtype: &str) -> BridgeResult<Self> {
        match msgtype {
            "m.text" => Ok(ActionKind::Message),
            "m.emote" => Ok(ActionKind::Emote),
            "m.notice" => Ok(ActionKind::Notice),
            "m.image" => Ok(ActionKind::Image),
            "m.file" => Ok(ActionKind::File),
            other => Err(BridgeError::UnknownActionKind {
                kind: other.to_string(),
            }),
        }
    }

    pub fn msgtype(&self) -> &'static str {
        match self {
            ActionKind::Emote => "m.emote",
            ActionKind::Notice => "m.notice",
            ActionKind::Image => "m.image",
            ActionKind::File => "m.file",
            ActionKind::Message | ActionKind::Topic => "m.text",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action as it appears on the room-based network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    pub kind: ActionKind,
    pub body: String,
    pub html_body: Option<String>,
}

impl RemoteAction {
    pub fn new(kind: ActionKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
            html_body: None,
        }
    }

    pub fn with_html(mut self, html_body: Option<String>) -> Self {
        self.html_body = html_body;
        self
    }
}

/// An action as it appears on IRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAction {
    pub kind: ActionKind,
    pub text: String,
}

impl LocalAction {
    pub fn new(kind: ActionKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// A room event delivered by the homeserver in a transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub room_id: String,
    #[serde(alias = "user_id")]
    pub sender: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl RemoteEvent {
    /// The `membership` field of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(|m| m.as_str())
    }
}

/// An inbound IRC event, tagged with the network and receiving identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub domain: String,
    /// Nick of the connection that received the event.
    pub receiver: String,
    pub receiver_is_bot: bool,
    pub kind: LocalEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEventKind {
    /// Message to a channel or to the receiver directly.
    Message {
        from: String,
        target: String,
        action: LocalAction,
    },
    Join {
        nick: String,
        channel: String,
    },
    Part {
        nick: String,
        channel: String,
        reason: Option<String>,
    },
    Mode {
        channel: String,
        by: String,
        mode: String,
        arg: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_parse() {
        assert_eq!(ActionKind::parse("emote").unwrap(), ActionKind::Emote);
        assert!(matches!(
            ActionKind::parse("sticker"),
            Err(BridgeError::UnknownActionKind { .. })
        ));
    }

    #[test]
    fn test_msgtype_mapping() {
        assert_eq!(ActionKind::from_msgtype("m.image").unwrap(), ActionKind::Image);
        assert_eq!(ActionKind::Notice.msgtype(), "m.notice");
        assert!(ActionKind::from_msgtype("m.location").is_err());
    }

    #[test]
    fn test_remote_event_deserialize() {
        let event: RemoteEvent = serde_json::from_value(serde_json::json!({
            "type": "m.room.member",
            "room_id": "!abc:hs",
            "user_id": "@alice:hs",
            "state_key": "@irc_bob:hs",
            "content": { "membership": "invite" }
        }))
        .unwrap();
        assert_eq!(event.sender, "@alice:hs");
        assert_eq!(event.membership(), Some("invite"));
    }
}
