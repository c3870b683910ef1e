//! Persistent identity and room mapping.
//!
//! One [`DocumentStore`] underneath, three typed repositories on top.

pub mod config;
pub mod document;
pub mod rooms;
pub mod users;

use std::sync::Arc;

pub use config::BridgeConfigRecord;

use config::ConfigRepository;
use document::DocumentStore;
use rooms::RoomRepository;
use users::UserRepository;

use crate::common::error::BridgeResult;

pub struct IdentityStore {
    pub config: ConfigRepository,
    pub rooms: RoomRepository,
    pub users: UserRepository,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config: ConfigRepository::new(store.clone()),
            rooms: RoomRepository::new(store.clone()),
            users: UserRepository::new(store),
        }
    }

    /// Open the database named by `uri` and wait until it is loaded.
    pub async fn connect(uri: &str) -> BridgeResult<Self> {
        Ok(Self::new(document::open(uri).await?))
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(document::MemoryDocumentStore::new()))
    }
}
