//! Local persistent KV store used for sleep/wake state, user relationships,
//! per-stream counters, and pipeline statistics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::StoreError;

/// Single state table: `key (str) → JSON bytes`.
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

/// Atomic get/set/delete over a redb file. Cheap to clone; all clones share
/// the same database handle.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl KvStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {}: {e}", parent.display())))?;
        }
        let db = Database::create(&path)?;

        // Ensure the table exists so first reads don't fail.
        {
            let tx = db.begin_write()?;
            tx.open_table(STATE_TABLE)?;
            tx.commit()?;
        }

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(STATE_TABLE)?;
            table.insert(key, bytes.as_slice())?;
        }
        tx.commit()?;
        debug!(key, bytes = bytes.len(), "kv set");
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(STATE_TABLE)?;
        match table.get(key)? {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        }
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let tx = self.db.begin_write()?;
        let existed = {
            let mut table = tx.open_table(STATE_TABLE)?;
            table.remove(key)?.is_some()
        };
        tx.commit()?;
        Ok(existed)
    }

    /// All keys starting with `prefix`, in lexical order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(STATE_TABLE)?;
        let mut keys = Vec::new();
        for row in table.iter()? {
            let (key, _) = row?;
            let key = key.value();
            if key.starts_with(prefix) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
