//! Local encrypted object storage implementation
//!
//! Each object lives in one file under the storage directory, encrypted with
//! AES-256-GCM under a master key. Deleting an object leaves a tombstone so
//! versions keep increasing if it is created again. Watches poll the file.
//!
//! Conditional writes are serialized within one process only; two processes
//! writing the same directory can still race between read and rename.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use crate::object_store::{ObjectList, ObjectStore, StoredObject, WatchEvent, WatchStream};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Master key for encrypting stored objects
type MasterKey = [u8; 32];

/// Environment variable holding the master key (hex, or any passphrase)
pub const MASTER_KEY_ENV: &str = "KEYWARD_MASTER_KEY";

/// Default watch polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// On-disk envelope for one object
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectFile {
    version: u64,
    #[serde(default)]
    deleted: bool,
    object: Option<StoredObject>,
}

impl ObjectFile {
    fn live(&self) -> Option<&StoredObject> {
        if self.deleted {
            None
        } else {
            self.object.as_ref()
        }
    }
}

struct Inner {
    /// Storage directory
    storage_path: PathBuf,
    /// Master encryption key
    master_key: MasterKey,
}

/// Local encrypted object store
pub struct LocalObjectStore {
    inner: Arc<Inner>,
    poll_interval: Duration,
    /// Serializes read-check-write sequences
    write_lock: Mutex<()>,
}

impl LocalObjectStore {
    /// Create a new local object store
    ///
    /// # Arguments
    /// * `storage_path` - Directory where encrypted objects will be stored
    /// * `master_key` - Optional master key (if None, will derive from environment or generate)
    pub async fn new<P: AsRef<Path>>(
        storage_path: P,
        master_key: Option<&[u8]>,
    ) -> KeyResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();

        fs::create_dir_all(&storage_path).await?;

        let master_key = if let Some(key) = master_key {
            if key.len() != 32 {
                return Err(KeyError::Configuration(
                    "Master key must be exactly 32 bytes".to_string(),
                ));
            }
            let mut mk = [0u8; 32];
            mk.copy_from_slice(key);
            mk
        } else {
            Self::derive_master_key()
        };

        info!(path = %storage_path.display(), "Local object store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                storage_path,
                master_key,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_lock: Mutex::new(()),
        })
    }

    /// Set how often watches re-read the object file
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Derive master key from environment variable or generate a new one
    fn derive_master_key() -> MasterKey {
        if let Ok(key_str) = std::env::var(MASTER_KEY_ENV) {
            // If it's a hex string, decode it
            if let Ok(key_bytes) = hex::decode(&key_str) {
                if key_bytes.len() == 32 {
                    let mut mk = [0u8; 32];
                    mk.copy_from_slice(&key_bytes);
                    return mk;
                }
            }
            // Otherwise, derive from string using SHA256
            let hash = Sha256::digest(key_str.as_bytes());
            let mut mk = [0u8; 32];
            mk.copy_from_slice(&hash);
            return mk;
        }

        // Objects written under a generated key are unreadable after restart
        warn!(
            "No {} found, generating a new one. This should be set in production!",
            MASTER_KEY_ENV
        );
        let mut master_key = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut master_key);
        master_key
    }

    async fn write_file(&self, namespace: &str, name: &str, file: &ObjectFile) -> KeyResult<()> {
        let path = self.inner.object_path(namespace, name);
        let tmp_path = path.with_extension("obj.tmp");
        let encrypted = self.inner.encrypt(&serde_json::to_vec(file)?)?;

        fs::write(&tmp_path, encrypted).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

impl Inner {
    /// Encrypt file contents
    fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(&self.master_key.into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyError::Crypto(format!("Encryption failed: {}", e)))?;

        // Prepend nonce to ciphertext
        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt file contents
    fn decrypt(&self, encrypted: &[u8]) -> KeyResult<Vec<u8>> {
        if encrypted.len() < 12 {
            return Err(KeyError::CorruptRecord("Encrypted object too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(&self.master_key.into());

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| KeyError::CorruptRecord("Object failed to decrypt under master key".to_string()))
    }

    /// Get path for object file
    fn object_path(&self, namespace: &str, name: &str) -> PathBuf {
        let sanitize = |s: &str| s.replace(['/', '\\'], "_");
        self.storage_path
            .join(format!("{}__{}.obj", sanitize(namespace), sanitize(name)))
    }

    /// Load and decrypt the object file, if any
    async fn read_file(&self, namespace: &str, name: &str) -> KeyResult<Option<ObjectFile>> {
        let path = self.object_path(namespace, name);
        let encrypted = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeyError::BackendUnavailable(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        };

        let plaintext = self.decrypt(&encrypted)?;
        let file = serde_json::from_slice::<ObjectFile>(&plaintext)
            .map_err(|e| KeyError::CorruptRecord(format!("{}: {}", path.display(), e)))?;
        Ok(Some(file))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, namespace: &str, name: &str) -> KeyResult<Option<StoredObject>> {
        let file = self.inner.read_file(namespace, name).await?;
        Ok(file.as_ref().and_then(ObjectFile::live).cloned())
    }

    async fn create(&self, mut object: StoredObject) -> KeyResult<StoredObject> {
        let _guard = self.write_lock.lock().await;
        let existing = self.inner.read_file(&object.namespace, &object.name).await?;
        if existing.as_ref().and_then(ObjectFile::live).is_some() {
            return Err(KeyError::AlreadyExists(object.qualified_name()));
        }

        let version = existing.map(|f| f.version).unwrap_or(0) + 1;
        object.resource_version = version.to_string();
        let file = ObjectFile {
            version,
            deleted: false,
            object: Some(object.clone()),
        };
        self.write_file(&object.namespace, &object.name, &file).await?;

        debug!(object = %object.qualified_name(), version, "Object created");
        Ok(object)
    }

    async fn update(&self, mut object: StoredObject) -> KeyResult<StoredObject> {
        let _guard = self.write_lock.lock().await;
        let existing = self.inner.read_file(&object.namespace, &object.name).await?;
        let current = match existing.as_ref() {
            Some(file) if file.live().is_some() => file.version,
            _ => return Err(KeyError::NotFound(object.qualified_name())),
        };

        if !object.resource_version.is_empty() && object.resource_version != current.to_string() {
            return Err(KeyError::Conflict {
                object: object.qualified_name(),
                expected: object.resource_version,
                actual: current.to_string(),
            });
        }

        let version = current + 1;
        object.resource_version = version.to_string();
        let file = ObjectFile {
            version,
            deleted: false,
            object: Some(object.clone()),
        };
        self.write_file(&object.namespace, &object.name, &file).await?;

        debug!(object = %object.qualified_name(), version, "Object updated");
        Ok(object)
    }

    async fn delete(&self, namespace: &str, name: &str) -> KeyResult<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.inner.read_file(namespace, name).await?;
        let (current, mut object) = match existing {
            Some(file) if !file.deleted => match file.object {
                Some(object) => (file.version, object),
                None => return Err(KeyError::NotFound(format!("{}/{}", namespace, name))),
            },
            _ => return Err(KeyError::NotFound(format!("{}/{}", namespace, name))),
        };

        info!(namespace, name, "Deleting object");
        let version = current + 1;
        object.resource_version = version.to_string();
        let tombstone = ObjectFile {
            version,
            deleted: true,
            object: Some(object),
        };
        self.write_file(namespace, name, &tombstone).await
    }

    async fn list(&self, namespace: &str, name: &str) -> KeyResult<ObjectList> {
        let file = self.inner.read_file(namespace, name).await?;
        let resource_version = file.as_ref().map(|f| f.version).unwrap_or(0).to_string();
        let items = file
            .as_ref()
            .and_then(ObjectFile::live)
            .cloned()
            .into_iter()
            .collect();

        Ok(ObjectList {
            items,
            resource_version,
        })
    }

    async fn watch(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> KeyResult<WatchStream> {
        let from: u64 = if resource_version.is_empty() {
            0
        } else {
            resource_version.parse().map_err(|_| {
                KeyError::BackendUnavailable(format!("invalid resource version {:?}", resource_version))
            })?
        };

        let inner = Arc::clone(&self.inner);
        let namespace = namespace.to_string();
        let name = name.to_string();
        let poll_interval = self.poll_interval;
        let (tx, rx) = mpsc::channel::<WatchEvent>(16);

        tokio::spawn(async move {
            let mut last = from;
            // Unknown at start; only matters for choosing Added vs Modified
            let mut was_live = from > 0;
            let mut ticker = tokio::time::interval(poll_interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!("Watch receiver dropped, stopping poll");
                    break;
                }

                let file = match inner.read_file(&namespace, &name).await {
                    Ok(Some(file)) => file,
                    Ok(None) => continue,
                    Err(e) => {
                        let _ = tx.send(WatchEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                if file.version <= last {
                    continue;
                }
                last = file.version;

                let event = match (file.deleted, file.object) {
                    (true, Some(object)) => {
                        was_live = false;
                        WatchEvent::Deleted(object)
                    }
                    (false, Some(object)) => {
                        let event = if was_live {
                            WatchEvent::Modified(object)
                        } else {
                            WatchEvent::Added(object)
                        };
                        was_live = true;
                        event
                    }
                    (_, None) => WatchEvent::Bookmark(file.version.to_string()),
                };

                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn store_type(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> LocalObjectStore {
        LocalObjectStore::new(dir.path(), Some(&[7u8; 32]))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_create_update_get() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut obj = StoredObject::new("ns", "keys");
        obj.data.insert("keyset.a".to_string(), b"{}".to_vec());

        let created = store.create(obj).await.unwrap();
        assert_eq!(created.resource_version, "1");

        let updated = store.update(created.clone()).await.unwrap();
        assert_eq!(updated.resource_version, "2");

        let fetched = store.get("ns", "keys").await.unwrap().unwrap();
        assert_eq!(fetched, updated);

        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, KeyError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_objects_are_encrypted_at_rest() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let mut obj = StoredObject::new("ns", "keys");
        obj.data.insert("keyset.plain-marker".to_string(), b"{}".to_vec());
        store.create(obj).await.unwrap();

        let raw = std::fs::read(dir.path().join("ns__keys.obj")).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("plain-marker"));

        let other = LocalObjectStore::new(dir.path(), Some(&[8u8; 32])).await.unwrap();
        assert!(matches!(
            other.get("ns", "keys").await,
            Err(KeyError::CorruptRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_versions_survive_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store.create(StoredObject::new("ns", "keys")).await.unwrap();
        store.delete("ns", "keys").await.unwrap();
        assert!(store.get("ns", "keys").await.unwrap().is_none());
        assert_eq!(store.list("ns", "keys").await.unwrap().resource_version, "2");

        let recreated = store.create(StoredObject::new("ns", "keys")).await.unwrap();
        assert_eq!(recreated.resource_version, "3");
    }

    #[tokio::test]
    async fn test_watch_polls_changes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let mut watch = store.watch("ns", "keys", "0").await.unwrap();

        let created = store.create(StoredObject::new("ns", "keys")).await.unwrap();
        match watch.next().await {
            Some(WatchEvent::Added(obj)) => assert_eq!(obj.resource_version, "1"),
            other => panic!("unexpected event {:?}", other),
        }

        store.update(created).await.unwrap();
        match watch.next().await {
            Some(WatchEvent::Modified(obj)) => assert_eq!(obj.resource_version, "2"),
            other => panic!("unexpected event {:?}", other),
        }

        store.delete("ns", "keys").await.unwrap();
        match watch.next().await {
            Some(WatchEvent::Deleted(obj)) => assert_eq!(obj.resource_version, "3"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
