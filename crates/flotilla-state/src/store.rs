//! The coordination-store capability and its redb implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::paths::{ancestors, child_prefix, normalize};
use crate::tables::NODES;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Hierarchical keyed byte blobs.
///
/// Every operation addressing a node that does not exist fails with
/// [`StateError::NoNode`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a node's data.
    async fn get(&self, path: &str) -> StateResult<Vec<u8>>;

    /// Create or overwrite a node, creating missing ancestors.
    async fn set(&self, path: &str, data: &[u8]) -> StateResult<()>;

    /// Remove a node together with its descendants.
    async fn delete(&self, path: &str) -> StateResult<()>;

    /// Names (not paths) of the direct children of a node.
    async fn list_children(&self, path: &str) -> StateResult<Vec<String>>;
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for RedbStore {
    async fn get(&self, path: &str) -> StateResult<Vec<u8>> {
        let path = normalize(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        match table.get(path.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StateError::NoNode(path)),
        }
    }

    async fn set(&self, path: &str, data: &[u8]) -> StateResult<()> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(StateError::InvalidPath(path));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for ancestor in ancestors(&path) {
                let exists = table.get(ancestor).map_err(map_err!(Read))?.is_some();
                if !exists {
                    table.insert(ancestor, b"".as_slice()).map_err(map_err!(Write))?;
                }
            }
            table.insert(path.as_str(), data).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, bytes = data.len(), "node stored");
        Ok(())
    }

    async fn delete(&self, path: &str) -> StateResult<()> {
        let path = normalize(path)?;
        let prefix = child_prefix(&path);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            if table.remove(path.as_str()).map_err(map_err!(Write))?.is_none() {
                return Err(StateError::NoNode(path));
            }
            let descendants: Vec<String> = table
                .range(prefix.as_str()..)
                .map_err(map_err!(Read))?
                .map_while(|entry| {
                    let (key, _) = entry.ok()?;
                    let key = key.value();
                    key.starts_with(&prefix).then(|| key.to_string())
                })
                .collect();
            for key in &descendants {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = descendants.len() + 1;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, removed, "node deleted");
        Ok(())
    }

    async fn list_children(&self, path: &str) -> StateResult<Vec<String>> {
        let path = normalize(path)?;
        let prefix = child_prefix(&path);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        if path != "/" && table.get(path.as_str()).map_err(map_err!(Read))?.is_none() {
            return Err(StateError::NoNode(path));
        }
        let mut children = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let Some(rest) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            if !rest.contains('/') {
                children.push(rest.to_string());
            }
        }
        Ok(children)
    }
}
