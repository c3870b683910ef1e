//! Room links.
//!
//! Documents look like
//! `{"type": "link", "remote_id": "!r:hs", "local_id": "#chan irc.net",
//!   "local": {"domain": .., "channel": ..}, "data": {"kind": .., ..}}`.
//! Admin links have a null `local_id` and no `local`.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::common::error::{BridgeResult, StoreError};
use crate::common::types::{to_irc_lower, Link, LinkData, LocalRoom, RemoteRoom};
use crate::irc::server::ServerPolicy;
use crate::store::document::{DocumentStore, ROOMS};

pub struct RoomRepository {
    store: Arc<dyn DocumentStore>,
}

fn normalise(local: &LocalRoom) -> LocalRoom {
    LocalRoom::new(local.domain.clone(), to_irc_lower(&local.channel))
}

fn link_doc(remote_id: &str, local: Option<&LocalRoom>, data: &LinkData) -> BridgeResult<Value> {
    let mut doc = Map::new();
    doc.insert("type".into(), json!("link"));
    doc.insert("remote_id".into(), json!(remote_id));
    doc.insert(
        "local_id".into(),
        local.map_or(Value::Null, |l| json!(l.store_id())),
    );
    if let Some(local) = local {
        doc.insert("local".into(), serde_json::to_value(normalise(local)).map_err(StoreError::from)?);
    }
    doc.insert("data".into(), serde_json::to_value(data).map_err(StoreError::from)?);
    Ok(Value::Object(doc))
}

fn parse_link(doc: Value) -> Option<Link> {
    let remote_id = doc.get("remote_id")?.as_str()?.to_string();
    let local = doc
        .get("local")
        .and_then(|l| serde_json::from_value(l.clone()).ok());
    let data = match doc.get("data").map(|d| serde_json::from_value(d.clone())) {
        Some(Ok(data)) => data,
        _ => {
            warn!("Skipping link for {} with unreadable data", remote_id);
            return None;
        }
    };
    Some(Link {
        remote_id,
        local,
        data,
    })
}

/// Turn a metadata query into a document query (`kind` -> `data.kind`).
fn data_query(query: &Value) -> Value {
    let mut fields = Map::new();
    fields.insert("type".into(), json!("link"));
    if let Some(obj) = query.as_object() {
        for (key, value) in obj {
            fields.insert(format!("data.{}", key), value.clone());
        }
    }
    Value::Object(fields)
}

impl RoomRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn links(&self, query: &Value) -> BridgeResult<Vec<Link>> {
        let docs = self.store.find(ROOMS, query).await?;
        Ok(docs.into_iter().filter_map(parse_link).collect())
    }

    /// Link a room to a channel, replacing the metadata of an existing link
    /// between the same pair.
    pub async fn link_rooms(
        &self,
        remote: &RemoteRoom,
        local: &LocalRoom,
        data: LinkData,
    ) -> BridgeResult<()> {
        info!(
            "link_rooms (id={}, addr={}, chan={}, kind={})",
            remote.room_id,
            local.domain,
            local.channel,
            data.kind()
        );
        let query = json!({
            "type": "link",
            "remote_id": remote.room_id,
            "local_id": local.store_id(),
        });
        let doc = link_doc(&remote.room_id, Some(local), &data)?;
        Ok(self.store.upsert(ROOMS, &query, doc).await?)
    }

    pub async fn linked_local_rooms(&self, remote_id: &str) -> BridgeResult<Vec<LocalRoom>> {
        let links = self
            .links(&json!({"type": "link", "remote_id": remote_id}))
            .await?;
        Ok(links.into_iter().filter_map(|l| l.local).collect())
    }

    pub async fn linked_remote_rooms(&self, local: &LocalRoom) -> BridgeResult<Vec<RemoteRoom>> {
        let links = self
            .links(&json!({"type": "link", "local_id": local.store_id()}))
            .await?;
        Ok(links
            .into_iter()
            .map(|l| RemoteRoom::new(l.remote_id))
            .collect())
    }

    /// Links whose metadata matches `query`, e.g. `{"kind": "pm"}`.
    pub async fn links_by_data(&self, query: &Value) -> BridgeResult<Vec<Link>> {
        self.links(&data_query(query)).await
    }

    pub async fn unlink(&self, remote_id: &str, local: &LocalRoom) -> BridgeResult<usize> {
        let query = json!({
            "type": "link",
            "remote_id": remote_id,
            "local_id": local.store_id(),
        });
        Ok(self.store.remove(ROOMS, &query).await?)
    }

    /// Room IDs that some configured mapping points at, without duplicates.
    pub async fn config_room_ids(&self) -> BridgeResult<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for link in self.links_by_data(&json!({"from_config": true})).await? {
            if !ids.contains(&link.remote_id) {
                ids.push(link.remote_id);
            }
        }
        Ok(ids)
    }

    /// Drop every link written from configuration.
    pub async fn remove_config_links(&self) -> BridgeResult<usize> {
        let removed = self
            .store
            .remove(ROOMS, &data_query(&json!({"kind": "channel", "from_config": true})))
            .await?;
        info!("Removed {} config mappings", removed);
        Ok(removed)
    }

    /// Write one config link per mapped (channel, room) pair of `server`.
    pub async fn seed_config_links(&self, server: &ServerPolicy) -> BridgeResult<usize> {
        let mut seeded = 0;
        for (channel, room_id) in server.mappings() {
            self.link_rooms(
                &RemoteRoom::new(room_id),
                &LocalRoom::new(server.domain(), channel),
                LinkData::Channel { from_config: true },
            )
            .await?;
            seeded += 1;
        }
        Ok(seeded)
    }

    /// Lower-cased channels on `domain` that have at least one link.
    pub async fn tracked_channels(&self, domain: &str) -> BridgeResult<Vec<String>> {
        let links = self
            .links(&json!({"type": "link", "local.domain": domain}))
            .await?;
        let mut channels: Vec<String> = Vec::new();
        for local in links.into_iter().filter_map(|l| l.local) {
            if !channels.contains(&local.channel) {
                channels.push(local.channel);
            }
        }
        Ok(channels)
    }

    /// Store the PM room between a real user and a virtual user, clobbering
    /// any previous one for the pair.
    pub async fn set_pm_link(
        &self,
        local: &LocalRoom,
        remote: &RemoteRoom,
        real_user_id: &str,
        virtual_user_id: &str,
    ) -> BridgeResult<()> {
        info!(
            "set_pm_link (id={}, addr={}, chan={}, real={}, virt={})",
            remote.room_id, local.domain, local.channel, real_user_id, virtual_user_id
        );
        let data = LinkData::Pm {
            real_user_id: real_user_id.to_string(),
            virtual_user_id: virtual_user_id.to_string(),
        };
        let query = data_query(&json!({
            "kind": "pm",
            "real_user_id": real_user_id,
            "virtual_user_id": virtual_user_id,
        }));
        let doc = link_doc(&remote.room_id, Some(local), &data)?;
        Ok(self.store.upsert(ROOMS, &query, doc).await?)
    }

    pub async fn pm_room(
        &self,
        real_user_id: &str,
        virtual_user_id: &str,
    ) -> BridgeResult<Option<RemoteRoom>> {
        let links = self
            .links_by_data(&json!({
                "kind": "pm",
                "real_user_id": real_user_id,
                "virtual_user_id": virtual_user_id,
            }))
            .await?;
        Ok(links.into_iter().next().map(|l| RemoteRoom::new(l.remote_id)))
    }

    pub async fn admin_room(&self, owner_id: &str) -> BridgeResult<Option<RemoteRoom>> {
        let links = self
            .links_by_data(&json!({"kind": "admin", "owner_id": owner_id}))
            .await?;
        Ok(links.into_iter().next().map(|l| RemoteRoom::new(l.remote_id)))
    }

    /// The admin room with this ID and its owner, if it is one.
    pub async fn admin_room_by_id(&self, room_id: &str) -> BridgeResult<Option<(RemoteRoom, String)>> {
        let mut query = data_query(&json!({"kind": "admin"}));
        query["remote_id"] = json!(room_id);
        let links = self.links(&query).await?;
        Ok(links.into_iter().find_map(|l| match l.data {
            LinkData::Admin { owner_id } => Some((RemoteRoom::new(l.remote_id), owner_id)),
            _ => None,
        }))
    }

    /// Make `room` the admin room of `owner_id`, replacing any previous one.
    pub async fn set_admin_room(&self, room: &RemoteRoom, owner_id: &str) -> BridgeResult<()> {
        info!("set_admin_room (id={}, user_id={})", room.room_id, owner_id);
        let data = LinkData::Admin {
            owner_id: owner_id.to_string(),
        };
        let query = data_query(&json!({"kind": "admin", "owner_id": owner_id}));
        let doc = link_doc(&room.room_id, None, &data)?;
        Ok(self.store.upsert(ROOMS, &query, doc).await?)
    }
}
