//! Registration names backed by the user store.
//!
//! Virtual users get an IRC username derived from their room-side localpart.
//! Usernames are unique per network: a clash with another owner gets a
//! numeric suffix, and the final choice is stored so later connections reuse
//! it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::common::error::BridgeResult;
use crate::common::types::{LocalIdentity, RemoteIdentity};
use crate::irc::wire::{IrcNames, NameService};
use crate::store::IdentityStore;

/// Longest username handed to the server.
pub const MAX_USERNAME_LEN: usize = 10;

/// Give up looking for a free suffix after this many.
const MAX_SUFFIX: usize = 1000;

/// Keep `[a-z0-9_-]`, lower-cased, at most `MAX_USERNAME_LEN` bytes.
pub fn sanitise_username(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    name.truncate(MAX_USERNAME_LEN);
    if name.is_empty() {
        name.push_str("user");
    }
    name
}

fn with_suffix(base: &str, n: usize) -> String {
    let suffix = n.to_string();
    let keep = MAX_USERNAME_LEN.saturating_sub(suffix.len()).min(base.len());
    format!("{}{}", &base[..keep], suffix)
}

pub struct StoreNames {
    store: Arc<IdentityStore>,
}

impl StoreNames {
    pub fn new(store: Arc<IdentityStore>) -> Self {
        Self { store }
    }

    async fn unique_username(&self, domain: &str, owner: &str, base: &str) -> BridgeResult<String> {
        let mut candidate = base.to_string();
        for n in 1..=MAX_SUFFIX {
            match self
                .store
                .users
                .local_identity_by_username(domain, &candidate)
                .await?
            {
                None => return Ok(candidate),
                Some((_, user_id)) if user_id == owner => return Ok(candidate),
                Some(_) => candidate = with_suffix(base, n),
            }
        }
        Ok(candidate)
    }
}

#[async_trait]
impl NameService for StoreNames {
    async fn resolve(
        &self,
        identity: &LocalIdentity,
        owner: Option<&RemoteIdentity>,
    ) -> BridgeResult<IrcNames> {
        let Some(owner) = owner else {
            return Ok(IrcNames {
                nick: identity.nick.clone(),
                username: identity
                    .username
                    .clone()
                    .unwrap_or_else(|| sanitise_username(&identity.nick)),
                realname: identity.nick.clone(),
            });
        };

        let username = match &identity.username {
            Some(username) => username.clone(),
            None => {
                let base = sanitise_username(owner.localpart());
                let username = self
                    .unique_username(&identity.domain, &owner.user_id, &base)
                    .await?;
                debug!("Assigned username {} to {}", username, owner.user_id);
                self.store
                    .users
                    .set_local_identity(
                        &owner.user_id,
                        &identity.clone().with_username(username.clone()),
                    )
                    .await?;
                username
            }
        };

        Ok(IrcNames {
            nick: identity.nick.clone(),
            username,
            realname: owner.user_id.clone(),
        })
    }
}
