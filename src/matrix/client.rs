//! Homeserver client.
//!
//! The bridge talks to the homeserver as the application service, optionally
//! masquerading as one of its virtual users via the `user_id` query
//! parameter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::{ActionKind, RemoteAction};
use crate::config::types::JoinRule;

const HTML_FORMAT: &str = "org.matrix.custom.html";
const CLIENT_API: [&str; 3] = ["_matrix", "client", "r0"];

/// Parameters for a room created for an IRC channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRoomOptions {
    /// Full alias, `#localpart:domain`.
    pub alias: String,
    pub name: String,
    pub topic: Option<String>,
    pub join_rule: JoinRule,
    pub publish: bool,
}

impl AliasRoomOptions {
    pub fn alias_localpart(&self) -> &str {
        let alias = self.alias.strip_prefix('#').unwrap_or(&self.alias);
        alias.split(':').next().unwrap_or(alias)
    }
}

/// Calls the bridge makes on the homeserver.
///
/// `as_user` names a virtual user to act as; `None` acts as the bridge bot.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Base URL, used to build media download links.
    fn homeserver_url(&self) -> &str;

    /// Full user ID for a localpart on this homeserver.
    fn user_id(&self, localpart: &str) -> String;

    async fn send_action(
        &self,
        as_user: Option<&str>,
        room_id: &str,
        action: &RemoteAction,
    ) -> BridgeResult<()>;

    /// Join a room by ID or alias, returning the room ID.
    async fn join_room(&self, as_user: Option<&str>, room: &str) -> BridgeResult<String>;

    async fn leave_room(&self, as_user: Option<&str>, room_id: &str) -> BridgeResult<()>;

    async fn invite(&self, as_user: Option<&str>, room_id: &str, invitee: &str) -> BridgeResult<()>;

    /// Private room created by `creator` with `invitee` invited.
    async fn create_room_with_user(
        &self,
        creator: &str,
        invitee: &str,
        name: &str,
    ) -> BridgeResult<String>;

    /// Room with an alias, created by the bridge bot. An alias already in use
    /// is assumed to be ours and is joined instead.
    async fn create_room_with_alias(&self, options: &AliasRoomOptions) -> BridgeResult<String>;

    /// Make sure a virtual user exists, returning its user ID.
    async fn register_user(&self, localpart: &str) -> BridgeResult<String>;

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> BridgeResult<()>;

    /// User IDs currently joined to a room, as seen by the bridge bot.
    async fn joined_members(&self, room_id: &str) -> BridgeResult<Vec<String>>;
}

/// Failures talking to the homeserver.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{status} {errcode}: {message}")]
    Matrix {
        status: StatusCode,
        errcode: String,
        message: String,
    },

    #[error("Bad URL: {0}")]
    Url(String),
}

impl ApiError {
    fn errcode(&self) -> Option<&str> {
        match self {
            ApiError::Matrix { errcode, .. } => Some(errcode),
            _ => None,
        }
    }
}

impl From<ApiError> for BridgeError {
    fn from(e: ApiError) -> Self {
        BridgeError::Remote(e.to_string())
    }
}

/// Strip HTML tags to build a plain-text fallback.
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Event content for a message action.
pub fn message_content(action: &RemoteAction) -> Value {
    match &action.html_body {
        Some(html) => json!({
            "msgtype": action.kind.msgtype(),
            "body": strip_html_tags(html),
            "format": HTML_FORMAT,
            "formatted_body": html,
        }),
        None => json!({
            "msgtype": action.kind.msgtype(),
            "body": action.body,
        }),
    }
}

/// `reqwest` implementation of [`RemoteClient`].
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    domain: String,
    token: String,
    txn_counter: AtomicU64,
}

impl HttpRemoteClient {
    pub fn new(
        base_url: impl Into<String>,
        domain: impl Into<String>,
        token: impl Into<String>,
    ) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BridgeError::Remote(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            domain: domain.into(),
            token: token.into(),
            txn_counter: AtomicU64::new(0),
        })
    }

    fn url(&self, segments: &[&str], as_user: Option<&str>) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| ApiError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Url(self.base_url.clone()))?
            .pop_if_empty()
            .extend(CLIENT_API.iter().chain(segments.iter()));
        url.query_pairs_mut()
            .append_pair("access_token", &self.token);
        if let Some(user) = as_user {
            url.query_pairs_mut().append_pair("user_id", user);
        }
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        as_user: Option<&str>,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let url = self.url(segments, as_user)?;
        debug!("{} /{}", method, segments.join("/"));
        let mut request = self.http.request(method, url);
        if !body.is_null() {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        Err(ApiError::Matrix {
            status,
            errcode: body
                .get("errcode")
                .and_then(Value::as_str)
                .unwrap_or("M_UNKNOWN")
                .to_string(),
            message: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    fn room_id_from(body: &Value) -> Result<String, ApiError> {
        body.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Matrix {
                status: StatusCode::OK,
                errcode: "M_BAD_JSON".to_string(),
                message: "response has no room_id".to_string(),
            })
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", chrono::Utc::now().timestamp_millis(), n)
    }

    async fn send_event(&self, as_user: Option<&str>, room_id: &str, content: &Value) -> Result<(), ApiError> {
        let txn_id = self.next_txn_id();
        self.call(
            Method::PUT,
            &["rooms", room_id, "send", "m.room.message", &txn_id],
            as_user,
            content,
        )
        .await
        .map(|_| ())
    }

    async fn set_topic(&self, as_user: Option<&str>, room_id: &str, topic: &str) -> Result<(), ApiError> {
        self.call(
            Method::PUT,
            &["rooms", room_id, "state", "m.room.topic", ""],
            as_user,
            &json!({ "topic": topic }),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    fn homeserver_url(&self) -> &str {
        &self.base_url
    }

    fn user_id(&self, localpart: &str) -> String {
        format!("@{}:{}", localpart, self.domain)
    }

    async fn send_action(
        &self,
        as_user: Option<&str>,
        room_id: &str,
        action: &RemoteAction,
    ) -> BridgeResult<()> {
        if action.kind == ActionKind::Topic {
            return self.set_topic(as_user, room_id, &action.body).await.map_err(|e| {
                error!("setTopic in {}: {}", room_id, e);
                e.into()
            });
        }

        let content = message_content(action);
        match self.send_event(as_user, room_id, &content).await {
            Ok(()) => Ok(()),
            Err(e) if e.errcode() == Some("M_FORBIDDEN") => {
                // Not in the room yet: join, then try once more.
                debug!("Forbidden in {}, joining before resending", room_id);
                if let Err(join_err) = self.join_room(as_user, room_id).await {
                    error!("sendMessage: couldn't join {}: {}", room_id, join_err);
                    return Err(join_err);
                }
                Ok(self.send_event(as_user, room_id, &content).await?)
            }
            Err(e) => {
                error!("sendMessage in {}: {}", room_id, e);
                Err(e.into())
            }
        }
    }

    async fn join_room(&self, as_user: Option<&str>, room: &str) -> BridgeResult<String> {
        let body = self.call(Method::POST, &["join", room], as_user, &json!({})).await?;
        Ok(Self::room_id_from(&body)?)
    }

    async fn leave_room(&self, as_user: Option<&str>, room_id: &str) -> BridgeResult<()> {
        self.call(Method::POST, &["rooms", room_id, "leave"], as_user, &json!({}))
            .await?;
        Ok(())
    }

    async fn invite(&self, as_user: Option<&str>, room_id: &str, invitee: &str) -> BridgeResult<()> {
        self.call(
            Method::POST,
            &["rooms", room_id, "invite"],
            as_user,
            &json!({ "user_id": invitee }),
        )
        .await?;
        Ok(())
    }

    async fn create_room_with_user(
        &self,
        creator: &str,
        invitee: &str,
        name: &str,
    ) -> BridgeResult<String> {
        let body = self
            .call(
                Method::POST,
                &["createRoom"],
                Some(creator),
                &json!({ "name": name, "visibility": "private" }),
            )
            .await?;
        let room_id = Self::room_id_from(&body)?;
        self.invite(Some(creator), &room_id, invitee).await?;
        Ok(room_id)
    }

    async fn create_room_with_alias(&self, options: &AliasRoomOptions) -> BridgeResult<String> {
        let join_rule = match options.join_rule {
            JoinRule::Public => "public",
            JoinRule::Invite => "invite",
        };
        let mut request = json!({
            "room_alias_name": options.alias_localpart(),
            "name": options.name,
            "visibility": if options.publish { "public" } else { "private" },
            "initial_state": [{
                "type": "m.room.join_rules",
                "state_key": "",
                "content": { "join_rule": join_rule },
            }],
        });
        if let Some(topic) = &options.topic {
            request["topic"] = json!(topic);
        }

        match self.call(Method::POST, &["createRoom"], None, &request).await {
            Ok(body) => {
                let room_id = Self::room_id_from(&body)?;
                info!("Created {} for alias {}", room_id, options.alias);
                Ok(room_id)
            }
            Err(e) if matches!(e.errcode(), Some("M_UNKNOWN") | Some("M_ROOM_IN_USE")) => {
                info!("Alias {} already exists, joining it", options.alias);
                self.join_room(None, &options.alias).await
            }
            Err(e) => {
                error!("Failed to create room for {}: {}", options.alias, e);
                Err(e.into())
            }
        }
    }

    async fn register_user(&self, localpart: &str) -> BridgeResult<String> {
        let result = self
            .call(
                Method::POST,
                &["register"],
                None,
                &json!({
                    "type": "m.login.application_service",
                    "username": localpart,
                    "user": localpart,
                }),
            )
            .await;
        match result {
            Ok(body) => Ok(body
                .get("user_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.user_id(localpart))),
            Err(e) if e.errcode() == Some("M_USER_IN_USE") => Ok(self.user_id(localpart)),
            Err(e) => {
                error!("register {}: {}", localpart, e);
                Err(e.into())
            }
        }
    }

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> BridgeResult<()> {
        self.call(
            Method::PUT,
            &["profile", user_id, "displayname"],
            Some(user_id),
            &json!({ "displayname": display_name }),
        )
        .await?;
        Ok(())
    }

    async fn joined_members(&self, room_id: &str) -> BridgeResult<Vec<String>> {
        let body = self
            .call(Method::GET, &["rooms", room_id, "joined_members"], None, &Value::Null)
            .await?;
        Ok(body
            .get("joined")
            .and_then(Value::as_object)
            .map(|joined| joined.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpRemoteClient {
        HttpRemoteClient::new("https://hs.example.org/", "hs.example.org", "secret").unwrap()
    }

    #[test]
    fn test_url_encodes_segments() {
        let url = client()
            .url(&["join", "#irc_#rust:hs.example.org"], Some("@irc_bob:hs.example.org"))
            .unwrap();
        assert_eq!(url.path(), "/_matrix/client/r0/join/%23irc_%23rust:hs.example.org");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("access_token".to_string(), "secret".to_string())));
        assert!(query.contains(&("user_id".to_string(), "@irc_bob:hs.example.org".to_string())));
    }

    #[test]
    fn test_bot_url_has_no_user_id() {
        let url = client().url(&["createRoom"], None).unwrap();
        assert!(!url.query_pairs().any(|(k, _)| k == "user_id"));
    }

    #[test]
    fn test_message_content() {
        let plain = message_content(&RemoteAction::new(ActionKind::Emote, "waves"));
        assert_eq!(plain, json!({"msgtype": "m.emote", "body": "waves"}));

        let html = message_content(
            &RemoteAction::new(ActionKind::Message, "\x02hi\x02")
                .with_html(Some("<b>hi</b> there".to_string())),
        );
        assert_eq!(html["body"], "hi there");
        assert_eq!(html["format"], HTML_FORMAT);
        assert_eq!(html["formatted_body"], "<b>hi</b> there");
    }

    #[test]
    fn test_user_id_and_alias_localpart() {
        assert_eq!(client().user_id("irc_bob"), "@irc_bob:hs.example.org");
        let options = AliasRoomOptions {
            alias: "#irc_#rust:hs.example.org".to_string(),
            name: "#rust".to_string(),
            topic: None,
            join_rule: JoinRule::Public,
            publish: true,
        };
        assert_eq!(options.alias_localpart(), "irc_#rust");
    }
}
