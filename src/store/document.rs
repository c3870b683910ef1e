//! Generic document store over JSON values.
//!
//! Documents live in named collections. Queries are JSON objects whose keys
//! are dotted paths into the document (`"data.kind"`) and whose values must
//! match exactly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::common::error::{StoreError, StoreResult};

pub const ROOMS: &str = "rooms";
pub const CONFIG: &str = "config";
pub const USERS: &str = "users";

const COLLECTIONS: [&str; 3] = [ROOMS, CONFIG, USERS];

/// CRUD over JSON documents.
///
/// Each call is atomic on its own; nothing spans calls.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, query: &Value) -> StoreResult<Vec<Value>>;

    async fn find_one(&self, collection: &str, query: &Value) -> StoreResult<Option<Value>> {
        Ok(self.find(collection, query).await?.into_iter().next())
    }

    /// Replace every document matching `query` with `doc`, or insert `doc`
    /// when nothing matches.
    async fn upsert(&self, collection: &str, query: &Value, doc: Value) -> StoreResult<()>;

    async fn insert(&self, collection: &str, doc: Value) -> StoreResult<()>;

    /// Remove every matching document and return how many went.
    async fn remove(&self, collection: &str, query: &Value) -> StoreResult<usize>;
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}

/// Whether `doc` satisfies every field of `query`.
pub fn matches(doc: &Value, query: &Value) -> bool {
    match query.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(path, expected)| lookup(doc, path) == Some(expected)),
        None => false,
    }
}

/// In-memory collections plus the readiness flag both stores share.
#[derive(Default)]
struct Collections {
    ready: AtomicBool,
    docs: RwLock<HashMap<String, Vec<Value>>>,
}

impl Collections {
    fn check_ready(&self) -> StoreResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotReady)
        }
    }

    fn find(&self, collection: &str, query: &Value) -> StoreResult<Vec<Value>> {
        self.check_ready()?;
        Ok(self
            .docs
            .read()
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches(d, query)).cloned().collect())
            .unwrap_or_default())
    }

    fn upsert(&self, collection: &str, query: &Value, doc: Value) -> StoreResult<()> {
        self.check_ready()?;
        let mut all = self.docs.write();
        let docs = all.entry(collection.to_string()).or_default();
        let mut replaced = false;
        for existing in docs.iter_mut().filter(|d| matches(d, query)) {
            *existing = doc.clone();
            replaced = true;
        }
        if !replaced {
            docs.push(doc);
        }
        Ok(())
    }

    fn insert(&self, collection: &str, doc: Value) -> StoreResult<()> {
        self.check_ready()?;
        self.docs
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    fn remove(&self, collection: &str, query: &Value) -> StoreResult<usize> {
        self.check_ready()?;
        let mut all = self.docs.write();
        let Some(docs) = all.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !matches(d, query));
        Ok(before - docs.len())
    }

    fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.docs.read().get(collection).cloned().unwrap_or_default()
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// Volatile store for `memory://` URIs and tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Collections,
}

impl MemoryDocumentStore {
    /// A store that is ready immediately.
    pub fn new() -> Self {
        let store = Self::default();
        store.mark_ready();
        store
    }

    /// A store that rejects every call until `mark_ready`.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::Release);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(&self, collection: &str, query: &Value) -> StoreResult<Vec<Value>> {
        self.inner.find(collection, query)
    }

    async fn upsert(&self, collection: &str, query: &Value, doc: Value) -> StoreResult<()> {
        self.inner.upsert(collection, query, doc)
    }

    async fn insert(&self, collection: &str, doc: Value) -> StoreResult<()> {
        self.inner.insert(collection, doc)
    }

    async fn remove(&self, collection: &str, query: &Value) -> StoreResult<usize> {
        self.inner.remove(collection, query)
    }
}

// ============================================================================
// File store
// ============================================================================

/// One `<collection>.db` file per collection, one JSON document per line.
///
/// Every mutation rewrites the affected file through a temp file and rename.
pub struct FileDocumentStore {
    dir: PathBuf,
    inner: Collections,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileDocumentStore {
    /// Create a store over `dir`. Not usable until [`load`](Self::load).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: Collections::default(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.db", collection))
    }

    /// Read every collection from disk and mark the store ready.
    pub async fn load(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.dir).await.map_err(|source| StoreError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut loaded = HashMap::new();
        for collection in COLLECTIONS {
            let path = self.path_for(collection);
            let docs = read_lines(&path).await?;
            debug!("Loaded {} documents from {}", docs.len(), path.display());
            loaded.insert(collection.to_string(), docs);
        }

        *self.inner.docs.write() = loaded;
        self.inner.ready.store(true, Ordering::Release);
        info!("Database ready at {}", self.dir.display());
        Ok(())
    }

    async fn persist(&self, collection: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let docs = self.inner.snapshot(collection);

        let mut data = String::new();
        for doc in &docs {
            data.push_str(&serde_json::to_string(doc)?);
            data.push('\n');
        }

        let path = self.path_for(collection);
        let temp_path = path.with_extension("db.tmp");
        let io_err = |source| StoreError::Io {
            path: temp_path.display().to_string(),
            source,
        };

        let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(data.as_bytes()).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(())
    }
}

async fn read_lines(path: &Path) -> StoreResult<Vec<Value>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn find(&self, collection: &str, query: &Value) -> StoreResult<Vec<Value>> {
        self.inner.find(collection, query)
    }

    async fn upsert(&self, collection: &str, query: &Value, doc: Value) -> StoreResult<()> {
        self.inner.upsert(collection, query, doc)?;
        self.persist(collection).await
    }

    async fn insert(&self, collection: &str, doc: Value) -> StoreResult<()> {
        self.inner.insert(collection, doc)?;
        self.persist(collection).await
    }

    async fn remove(&self, collection: &str, query: &Value) -> StoreResult<usize> {
        let removed = self.inner.remove(collection, query)?;
        if removed > 0 {
            self.persist(collection).await?;
        }
        Ok(removed)
    }
}

/// Open the store named by a `file://<dir>` or `memory://` URI.
pub async fn open(uri: &str) -> StoreResult<Arc<dyn DocumentStore>> {
    info!("Connecting to database {}", uri);
    if let Some(dir) = uri.strip_prefix("file://") {
        let store = FileDocumentStore::new(dir);
        store.load().await?;
        Ok(Arc::new(store))
    } else if uri.starts_with("memory://") {
        Ok(Arc::new(MemoryDocumentStore::new()))
    } else {
        Err(StoreError::BadUri {
            uri: uri.to_string(),
        })
    }
}
