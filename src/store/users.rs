//! User records.
//!
//! Three document types share the collection:
//! - `remote`: a room-side user keyed by localpart, with display name;
//! - `local`: an IRC identity some room-side user registered as, keyed by
//!   `"<domain> <user_id>"`;
//! - `union`: the link from a `local` document to the room-side user ID.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::common::error::BridgeResult;
use crate::common::types::{LocalIdentity, RemoteIdentity};
use crate::store::document::{DocumentStore, USERS};

pub struct UserRepository {
    store: Arc<dyn DocumentStore>,
}

fn local_key(domain: &str, user_id: &str) -> String {
    format!("{} {}", domain, user_id)
}

fn str_field(doc: &serde_json::Value, key: &str) -> Option<String> {
    doc.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_local(doc: &serde_json::Value) -> Option<LocalIdentity> {
    Some(LocalIdentity {
        domain: str_field(doc, "domain")?,
        nick: str_field(doc, "nick")?,
        password: str_field(doc, "password"),
        username: str_field(doc, "username"),
        is_bot: false,
    })
}

impl UserRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// A room-side user previously stored under `localpart`.
    pub async fn remote_identity(&self, localpart: &str) -> BridgeResult<Option<RemoteIdentity>> {
        let doc = self
            .store
            .find_one(USERS, &json!({"type": "remote", "localpart": localpart}))
            .await?;
        Ok(doc.and_then(|doc| {
            Some(RemoteIdentity {
                user_id: str_field(&doc, "id")?,
                display_name: str_field(&doc, "display_name"),
            })
        }))
    }

    pub async fn set_remote_identity(&self, identity: &RemoteIdentity) -> BridgeResult<()> {
        info!(
            "store_user (user_id={}, localpart={}, display_name={:?})",
            identity.user_id,
            identity.localpart(),
            identity.display_name
        );
        let query = json!({"type": "remote", "id": identity.user_id});
        let doc = json!({
            "type": "remote",
            "id": identity.user_id,
            "localpart": identity.localpart(),
            "display_name": identity.display_name,
        });
        Ok(self.store.upsert(USERS, &query, doc).await?)
    }

    /// The IRC identity `user_id` uses on `domain`.
    pub async fn local_identity(
        &self,
        user_id: &str,
        domain: &str,
    ) -> BridgeResult<Option<LocalIdentity>> {
        let doc = self
            .store
            .find_one(
                USERS,
                &json!({"type": "local", "id": local_key(domain, user_id)}),
            )
            .await?;
        Ok(doc.as_ref().and_then(parse_local))
    }

    pub async fn set_local_identity(
        &self,
        user_id: &str,
        identity: &LocalIdentity,
    ) -> BridgeResult<()> {
        info!("Storing {} on behalf of {}", identity, user_id);
        let id = local_key(&identity.domain, user_id);
        let doc = json!({
            "type": "local",
            "id": id,
            "domain": identity.domain,
            "nick": identity.nick,
            "password": identity.password,
            "username": identity.username,
        });
        self.store
            .upsert(USERS, &json!({"type": "local", "id": id}), doc)
            .await?;

        let union = json!({"type": "union", "local_id": id, "remote_id": user_id});
        self.store
            .upsert(USERS, &json!({"type": "union", "local_id": id}), union)
            .await?;
        Ok(())
    }

    /// Reverse lookup of an IRC username to the identity and the room-side
    /// user that owns it.
    pub async fn local_identity_by_username(
        &self,
        domain: &str,
        username: &str,
    ) -> BridgeResult<Option<(LocalIdentity, String)>> {
        let Some(doc) = self
            .store
            .find_one(
                USERS,
                &json!({"type": "local", "domain": domain, "username": username}),
            )
            .await?
        else {
            return Ok(None);
        };
        let (Some(identity), Some(id)) = (parse_local(&doc), str_field(&doc, "id")) else {
            return Ok(None);
        };

        let union = self
            .store
            .find_one(USERS, &json!({"type": "union", "local_id": id}))
            .await?;
        Ok(union
            .and_then(|u| str_field(&u, "remote_id"))
            .map(|user_id| (identity, user_id)))
    }
}
