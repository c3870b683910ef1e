//! The singleton bridge configuration record.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::common::error::{BridgeResult, StoreError};
use crate::store::document::{DocumentStore, CONFIG};

/// What `--generate-registration` leaves behind for later startups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfigRecord {
    pub hs_token: String,
}

pub struct ConfigRepository {
    store: Arc<dyn DocumentStore>,
}

impl ConfigRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> BridgeResult<Option<BridgeConfigRecord>> {
        match self.store.find_one(CONFIG, &json!({})).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, record: &BridgeConfigRecord) -> BridgeResult<()> {
        let doc = serde_json::to_value(record).map_err(StoreError::from)?;
        Ok(self.store.upsert(CONFIG, &json!({}), doc).await?)
    }
}
