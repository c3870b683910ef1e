//! In-memory homeserver fake shared by tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::common::error::{BridgeError, BridgeResult};
use crate::common::messages::RemoteAction;
use crate::matrix::client::{AliasRoomOptions, RemoteClient};

pub const HS_DOMAIN: &str = "hs.example.org";

/// One call made on the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Send {
        as_user: Option<String>,
        room_id: String,
        action: RemoteAction,
    },
    Join {
        as_user: Option<String>,
        room: String,
    },
    Leave {
        as_user: Option<String>,
        room_id: String,
    },
    Invite {
        as_user: Option<String>,
        room_id: String,
        invitee: String,
    },
    CreateWithUser {
        creator: String,
        invitee: String,
    },
    CreateWithAlias {
        alias: String,
    },
    Register {
        localpart: String,
    },
    DisplayName {
        user_id: String,
        display_name: String,
    },
}

#[derive(Default)]
pub struct MockRemoteClient {
    pub calls: Mutex<Vec<RemoteCall>>,
    /// Returned by `joined_members` for every room.
    pub members: Mutex<Vec<String>>,
    pub fail_sends: Mutex<bool>,
    rooms_created: AtomicUsize,
}

impl MockRemoteClient {
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn sends(&self) -> Vec<(Option<String>, String, RemoteAction)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                RemoteCall::Send {
                    as_user,
                    room_id,
                    action,
                } => Some((as_user.clone(), room_id.clone(), action.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }

    fn new_room(&self) -> String {
        let n = self.rooms_created.fetch_add(1, Ordering::SeqCst) + 1;
        format!("!new{}:{}", n, HS_DOMAIN)
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    fn homeserver_url(&self) -> &str {
        "https://hs.example.org"
    }

    fn user_id(&self, localpart: &str) -> String {
        format!("@{}:{}", localpart, HS_DOMAIN)
    }

    async fn send_action(
        &self,
        as_user: Option<&str>,
        room_id: &str,
        action: &RemoteAction,
    ) -> BridgeResult<()> {
        if *self.fail_sends.lock() {
            return Err(BridgeError::Remote("M_FORBIDDEN".to_string()));
        }
        self.record(RemoteCall::Send {
            as_user: as_user.map(str::to_string),
            room_id: room_id.to_string(),
            action: action.clone(),
        });
        Ok(())
    }

    async fn join_room(&self, as_user: Option<&str>, room: &str) -> BridgeResult<String> {
        self.record(RemoteCall::Join {
            as_user: as_user.map(str::to_string),
            room: room.to_string(),
        });
        Ok(room.to_string())
    }

    async fn leave_room(&self, as_user: Option<&str>, room_id: &str) -> BridgeResult<()> {
        self.record(RemoteCall::Leave {
            as_user: as_user.map(str::to_string),
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    async fn invite(&self, as_user: Option<&str>, room_id: &str, invitee: &str) -> BridgeResult<()> {
        self.record(RemoteCall::Invite {
            as_user: as_user.map(str::to_string),
            room_id: room_id.to_string(),
            invitee: invitee.to_string(),
        });
        Ok(())
    }

    async fn create_room_with_user(
        &self,
        creator: &str,
        invitee: &str,
        _name: &str,
    ) -> BridgeResult<String> {
        self.record(RemoteCall::CreateWithUser {
            creator: creator.to_string(),
            invitee: invitee.to_string(),
        });
        Ok(self.new_room())
    }

    async fn create_room_with_alias(&self, options: &AliasRoomOptions) -> BridgeResult<String> {
        self.record(RemoteCall::CreateWithAlias {
            alias: options.alias.clone(),
        });
        Ok(self.new_room())
    }

    async fn register_user(&self, localpart: &str) -> BridgeResult<String> {
        self.record(RemoteCall::Register {
            localpart: localpart.to_string(),
        });
        Ok(self.user_id(localpart))
    }

    async fn set_display_name(&self, user_id: &str, display_name: &str) -> BridgeResult<()> {
        self.record(RemoteCall::DisplayName {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        });
        Ok(())
    }

    async fn joined_members(&self, _room_id: &str) -> BridgeResult<Vec<String>> {
        Ok(self.members.lock().clone())
    }
}
