//! LMDB-backed durable storage.
//!
//! Uses the heed crate (Rust bindings for LMDB). A single unnamed database
//! maps storage keys to UTF-8 blobs.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use stoop_core::PersistenceError;

use super::DurableStorage;

fn backend_error(context: &str, e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Backend {
        reason: format!("{context}: {e}"),
    }
}

/// Durable storage in an LMDB environment.
///
/// LMDB transactions block, so every call runs on the blocking pool.
#[derive(Clone)]
pub struct LmdbStorage {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbStorage {
    /// Open (or create) the environment in `path`.
    ///
    /// `max_size_mb` bounds the memory map and therefore the database size.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this
        // process and never concurrently remapped.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| backend_error("open environment", e))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| backend_error("begin write", e))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| backend_error("open database", e))?;
        wtxn.commit().map_err(|e| backend_error("commit", e))?;

        Ok(Self { env, db })
    }

    fn get_blocking(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| backend_error("begin read", e))?;
        let bytes = self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(|e| backend_error("get", e))?;
        match bytes {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec()).map_err(|e| PersistenceError::Serde {
                    reason: e.to_string(),
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn set_blocking(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| backend_error("begin write", e))?;
        self.db
            .put(&mut wtxn, key.as_bytes(), value.as_bytes())
            .map_err(|e| backend_error("put", e))?;
        wtxn.commit().map_err(|e| backend_error("commit", e))
    }

    fn remove_blocking(&self, key: &str) -> Result<(), PersistenceError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| backend_error("begin write", e))?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| backend_error("delete", e))?;
        wtxn.commit().map_err(|e| backend_error("commit", e))
    }

    async fn run_blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&LmdbStorage) -> Result<T, PersistenceError> + Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| backend_error(op, e))?
    }
}

#[async_trait]
impl DurableStorage for LmdbStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let key = key.to_string();
        self.run_blocking("get", move |storage| storage.get_blocking(&key))
            .await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        let key = key.to_string();
        self.run_blocking("put", move |storage| storage.set_blocking(&key, &value))
            .await
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let key = key.to_string();
        self.run_blocking("delete", move |storage| storage.remove_blocking(&key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LmdbStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = LmdbStorage::open(dir.path(), 10).unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn test_put_get_overwrite_delete() {
        let (storage, _dir) = create_test_storage();

        assert_eq!(storage.get("snapshot").await.unwrap(), None);
        storage.set("snapshot", "first".to_string()).await.unwrap();
        storage.set("snapshot", "second".to_string()).await.unwrap();
        assert_eq!(
            storage.get("snapshot").await.unwrap(),
            Some("second".to_string())
        );

        storage.remove("snapshot").await.unwrap();
        assert_eq!(storage.get("snapshot").await.unwrap(), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiting_write_does_not_stall_runtime() {
        let (storage, _dir) = create_test_storage();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // Another thread holds the LMDB write lock until released.
        let env = storage.env.clone();
        let holder = std::thread::spawn(move || {
            let wtxn = env.write_txn().unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            wtxn.abort();
        });
        locked_rx.recv().unwrap();

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move { storage.set("snapshot", "queued".to_string()).await })
        };
        // Only reachable if the queued write is off the runtime thread.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        release_tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
        holder.join().unwrap();
        assert_eq!(storage.get("snapshot").await.unwrap(), Some("queued".to_string()));
    }
}
