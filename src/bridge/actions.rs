//! Translation between room events, neutral actions and IRC actions.

use serde_json::Value;

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::{ActionKind, LocalAction, RemoteAction, RemoteEvent};
use crate::irc::formatting::{html_to_irc, irc_to_html};

const HTML_FORMAT: &str = "org.matrix.custom.html";

/// HTTP download URL for an `mxc://server/id` content URI.
pub fn decode_mxc(homeserver_url: &str, mxc: &str) -> String {
    let path = mxc.strip_prefix("mxc://").unwrap_or(mxc);
    format!(
        "{}/_matrix/media/v1/download/{}",
        homeserver_url.trim_end_matches('/'),
        path
    )
}

fn str_field<'a>(content: &'a Value, key: &str) -> Option<&'a str> {
    content.get(key).and_then(Value::as_str)
}

/// Build the neutral action for a room message or topic event.
pub fn from_remote_event(event: &RemoteEvent, homeserver_url: &str) -> BridgeResult<RemoteAction> {
    let content = &event.content;
    match event.event_type.as_str() {
        "m.room.message" => {
            let msgtype = str_field(content, "msgtype").unwrap_or("m.text");
            let kind = ActionKind::from_msgtype(msgtype)?;
            let body = str_field(content, "body").unwrap_or_default();

            if matches!(kind, ActionKind::Image | ActionKind::File) {
                let url = decode_mxc(homeserver_url, str_field(content, "url").unwrap_or_default());
                let size = content
                    .get("info")
                    .and_then(|info| info.get("size"))
                    .and_then(Value::as_f64)
                    .map(|bytes| format!(" ({}KB)", (bytes / 1024.0).round() as u64))
                    .unwrap_or_default();
                return Ok(RemoteAction::new(kind, format!("{} - {}{}", url, body, size)));
            }

            let html = (str_field(content, "format") == Some(HTML_FORMAT))
                .then(|| str_field(content, "formatted_body"))
                .flatten()
                .map(str::to_string);
            Ok(RemoteAction::new(kind, body).with_html(html))
        }
        "m.room.topic" => Ok(RemoteAction::new(
            ActionKind::Topic,
            str_field(content, "topic").unwrap_or_default(),
        )),
        other => Err(BridgeError::UnknownActionKind {
            kind: other.to_string(),
        }),
    }
}

/// Room-side action to what IRC should see.
pub fn to_local(action: &RemoteAction) -> LocalAction {
    match action.kind {
        ActionKind::Message | ActionKind::Emote | ActionKind::Notice => {
            let text = match &action.html_body {
                Some(html) => html_to_irc(html),
                None => action.body.clone(),
            };
            LocalAction::new(action.kind, text)
        }
        ActionKind::Image => {
            LocalAction::new(ActionKind::Notice, format!("Posted an Image: {}", action.body))
        }
        ActionKind::File => {
            LocalAction::new(ActionKind::Notice, format!("Posted a File: {}", action.body))
        }
        ActionKind::Topic => LocalAction::new(ActionKind::Topic, action.body.clone()),
    }
}

/// IRC action to what the room should see.
///
/// IRC has no media actions; those are rejected.
pub fn to_remote(action: &LocalAction) -> BridgeResult<RemoteAction> {
    match action.kind {
        ActionKind::Message | ActionKind::Emote | ActionKind::Notice => {
            let html = irc_to_html(&action.text);
            let html = (html != action.text).then_some(html);
            Ok(RemoteAction::new(action.kind, action.text.clone()).with_html(html))
        }
        ActionKind::Topic => Ok(RemoteAction::new(ActionKind::Topic, action.text.clone())),
        ActionKind::Image | ActionKind::File => Err(BridgeError::UnknownActionKind {
            kind: action.kind.to_string(),
        }),
    }
}
