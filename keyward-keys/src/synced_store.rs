//! Key store synchronized through a shared versioned object
//!
//! All key sets live in one object of an [`ObjectStore`]. Writers perform
//! conditional read-modify-write cycles against it and every process keeps
//! its cache current by listing and then watching the object.
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


use crate::cache::SyncedCache;
use crate::codec::{self, KeySetChange};
use crate::error::{KeyError, KeyResult};
use crate::key::Key;
use crate::key_set::KeySet;
use crate::key_store::KeyStore;
use crate::key_types::{KeyId, KeyRecord, KeyType};
use crate::object_store::{ObjectStore, StoredObject, WatchEvent};
use crate::retry::RetryConfig;
use crate::rsa_key::DEFAULT_RSA_BITS;
use async_trait::async_trait;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default pause between watch attempts
pub const DEFAULT_WATCH_BACKOFF: Duration = Duration::from_secs(10);

/// Phase of the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Not started yet
    Idle,
    /// Fetching the object to resynchronize the cache
    Listing,
    /// Applying change events
    Watching,
    /// Waiting before the next attempt
    Backoff,
    /// Cancelled
    Stopped,
}

/// Tuning for a [`SyncedKeyStore`]
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Modulus size for generated signing keys
    pub rsa_bits: usize,
    /// Restarts of a read-modify-write after a conflicting write
    pub write_retry: RetryConfig,
    /// Delay between watch attempts. Retries are unbounded.
    pub watch_backoff: RetryConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            rsa_bits: DEFAULT_RSA_BITS,
            write_retry: RetryConfig::default(),
            watch_backoff: RetryConfig::fixed(DEFAULT_WATCH_BACKOFF),
        }
    }
}

/// Whether to add a version when the key set already has an active key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    EnsureActive,
    Rotate,
}

/// Key store backed by a single object shared between processes
pub struct SyncedKeyStore {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    name: String,
    options: SyncOptions,
    cache: Arc<SyncedCache>,
    state: watch::Sender<WatchState>,
}

impl SyncedKeyStore {
    /// Create a store for object `name` in `namespace`. The cache stays empty
    /// until a key set is requested or [`watch_forever`](Self::watch_forever)
    /// runs.
    pub fn new(store: Arc<dyn ObjectStore>, namespace: &str, name: &str) -> Self {
        Self::with_options(store, namespace, name, SyncOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn ObjectStore>,
        namespace: &str,
        name: &str,
        options: SyncOptions,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Idle);
        Self {
            store,
            namespace: namespace.to_string(),
            name: name.to_string(),
            options,
            cache: Arc::new(SyncedCache::new()),
            state,
        }
    }

    pub fn cache(&self) -> &Arc<SyncedCache> {
        &self.cache
    }

    /// Handle for key set `name` if the cache already holds it. Never
    /// touches the backend.
    pub fn cached_key_set(&self, name: &str) -> Option<KeySet> {
        self.cache
            .entry(name)
            .map(|_| KeySet::new(name, Arc::clone(&self.cache)))
    }

    /// Observe the phase of the watch loop
    pub fn watch_state(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    /// Make sure key set `name` has an active key, creating the first
    /// version with `key_type` if needed. Returns the active id.
    pub async fn ensure_key_set(&self, name: &str, key_type: KeyType) -> KeyResult<KeyId> {
        codec::validate_name(name)?;
        self.write_key_set(name, key_type, WriteMode::EnsureActive).await
    }

    /// Add a new version of `key_type` to key set `name` and make it active.
    /// Older versions are kept so existing ciphertexts and signatures stay
    /// verifiable.
    pub async fn rotate(&self, name: &str, key_type: KeyType) -> KeyResult<KeyId> {
        codec::validate_name(name)?;
        let id = self.write_key_set(name, key_type, WriteMode::Rotate).await?;
        info!(key_set = name, key_id = id, "Key set rotated");
        Ok(id)
    }

    /// Keep the cache synchronized with the backing object until `shutdown`
    /// turns true or its sender is dropped. Never returns an error: failures
    /// are logged and retried after the backoff.
    pub async fn watch_forever(&self, mut shutdown: watch::Receiver<bool>) -> KeyResult<()> {
        info!(
            object = %self.qualified_name(),
            backend = self.store.store_type(),
            "Starting object watch"
        );

        let mut failures: u32 = 0;
        loop {
            let mut established = false;
            let outcome = tokio::select! {
                result = self.watch_once(&mut established) => Some(result),
                _ = cancelled(&mut shutdown) => None,
            };

            let e = match outcome {
                None => break,
                Some(Err(e)) => e,
                Some(Ok(never)) => match never {},
            };

            failures = if established { 1 } else { failures.saturating_add(1) };
            let delay = self.options.watch_backoff.delay_for_attempt(failures);
            warn!(
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Object watch interrupted, will retry"
            );

            self.state.send_replace(WatchState::Backoff);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }

        self.state.send_replace(WatchState::Stopped);
        info!(object = %self.qualified_name(), "Object watch stopped");
        Ok(())
    }

    /// One list-then-watch cycle. Only returns on failure or stream end.
    async fn watch_once(&self, established: &mut bool) -> KeyResult<Infallible> {
        self.state.send_replace(WatchState::Listing);

        let list = self.store.list(&self.namespace, &self.name).await?;
        let mut found = false;
        for item in &list.items {
            if item.name != self.name || item.namespace != self.namespace {
                warn!(object = %item.qualified_name(), "Ignoring unexpected object in list");
                continue;
            }
            found = true;
            self.cache.apply_update(item);
        }
        if !found {
            debug!(object = %self.qualified_name(), "Backing object does not exist yet");
            self.cache.apply_delete(&list.resource_version);
        }

        let mut events = self
            .store
            .watch(&self.namespace, &self.name, &list.resource_version)
            .await?;
        self.state.send_replace(WatchState::Watching);
        *established = true;
        debug!(resource_version = %list.resource_version, "Watching backing object");

        while let Some(event) = events.next().await {
            match event {
                WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                    self.check_own(&object)?;
                    self.cache.apply_update(&object);
                }
                WatchEvent::Deleted(object) => {
                    self.check_own(&object)?;
                    self.cache.apply_delete(&object.resource_version);
                }
                WatchEvent::Bookmark(_) => {}
                WatchEvent::Error(message) => {
                    return Err(KeyError::BackendUnavailable(format!(
                        "unexpected error from watch: {}",
                        message
                    )));
                }
            }
        }

        Err(KeyError::BackendUnavailable(
            "watch channel was closed".to_string(),
        ))
    }

    async fn write_key_set(&self, name: &str, key_type: KeyType, mode: WriteMode) -> KeyResult<KeyId> {
        let retry = &self.options.write_retry;
        // Generated at most once and reused by every retry
        let mut material: Option<KeyRecord> = None;

        let mut attempt: u32 = 0;
        loop {
            match self.try_write_key_set(name, key_type, &mut material, mode).await {
                Err(e) if e.is_write_conflict() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(
                        key_set = name,
                        attempt,
                        error = %e,
                        "Write conflict, restarting read-modify-write"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(key_set = name, error = %e, "Failed to write key set");
                    return Err(e);
                }
                Ok(id) => return Ok(id),
            }
        }
    }

    async fn try_write_key_set(
        &self,
        name: &str,
        key_type: KeyType,
        material: &mut Option<KeyRecord>,
        mode: WriteMode,
    ) -> KeyResult<KeyId> {
        let field = codec::field_name(name);
        let existing = self.store.get(&self.namespace, &self.name).await?;

        let mut object = match existing {
            Some(object) => object,
            None => StoredObject::new(&self.namespace, &self.name),
        };
        let create = object.resource_version.is_empty();

        let change = codec::plan_key_version(
            name,
            object.data.get(&field).map(Vec::as_slice),
            key_type,
            mode == WriteMode::Rotate,
        )?;

        let pending = match change {
            KeySetChange::Unchanged(id) => {
                self.cache.apply_update(&object);
                return Ok(id);
            }
            KeySetChange::NeedsVersion(pending) => pending,
        };

        let record = match material {
            Some(record) => record,
            None => material.insert(self.generate_material(key_type).await?),
        };
        let id = pending.id();
        object.data.insert(field, pending.finish(record)?);

        let written = if create {
            self.store.create(object).await?
        } else {
            self.store.update(object).await?
        };
        debug!(
            key_set = name,
            key_id = id,
            resource_version = %written.resource_version,
            "Key version written"
        );
        self.cache.apply_update(&written);
        Ok(id)
    }

    /// Generate key material off the async runtime; the id is assigned
    /// when the version is written.
    async fn generate_material(&self, key_type: KeyType) -> KeyResult<KeyRecord> {
        let rsa_bits = self.options.rsa_bits;
        tokio::task::spawn_blocking(move || {
            Key::generate(key_type, 0, rsa_bits).map(|key| key.record().clone())
        })
        .await
        .map_err(|e| KeyError::Crypto(format!("key generation task failed: {}", e)))?
    }

    fn check_own(&self, object: &StoredObject) -> KeyResult<()> {
        if object.name == self.name && object.namespace == self.namespace {
            Ok(())
        } else {
            Err(KeyError::BackendUnavailable(format!(
                "watch delivered unexpected object {}",
                object.qualified_name()
            )))
        }
    }

    fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[async_trait]
impl KeyStore for SyncedKeyStore {
    async fn key_set(&self, name: &str, key_type: KeyType) -> KeyResult<KeySet> {
        codec::validate_name(name)?;
        let key_set = KeySet::new(name, Arc::clone(&self.cache));
        if key_set.active_key().is_ok() {
            return Ok(key_set);
        }

        let creation_failed = |source: KeyError| KeyError::CreationFailed {
            name: name.to_string(),
            source: Box::new(source),
        };

        self.write_key_set(name, key_type, WriteMode::EnsureActive)
            .await
            .map_err(creation_failed)?;
        key_set.active_key().map_err(creation_failed)?;

        Ok(key_set)
    }
}

/// Resolves once `shutdown` carries `true` or its sender is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryObjectStore;

    fn fast_options() -> SyncOptions {
        SyncOptions {
            rsa_bits: DEFAULT_RSA_BITS,
            write_retry: RetryConfig::new(5, Duration::from_millis(1), Duration::from_millis(5), 2.0),
            watch_backoff: RetryConfig::fixed(Duration::from_millis(20)),
        }
    }

    fn synced(store: &Arc<MemoryObjectStore>) -> SyncedKeyStore {
        SyncedKeyStore::with_options(store.clone(), "keyward-system", "keyward-keys", fast_options())
    }

    #[tokio::test]
    async fn test_key_set_created_on_first_use() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = synced(&store);

        let key_set = keys.key_set("sessions", KeyType::SymmetricAead).await.unwrap();
        assert_eq!(key_set.active_id(), Some(1));

        let object = store.get("keyward-system", "keyward-keys").await.unwrap().unwrap();
        assert!(object.data.contains_key("keyset.sessions"));
        assert_eq!(keys.cache().resource_version(), 1);
    }

    #[tokio::test]
    async fn test_second_request_reuses_existing_key() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = synced(&store);

        keys.key_set("sessions", KeyType::SymmetricAead).await.unwrap();
        let version = store.current_version().await;
        let again = keys.key_set("sessions", KeyType::SymmetricAead).await.unwrap();

        assert_eq!(again.active_id(), Some(1));
        assert_eq!(store.current_version().await, version);
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_versions() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = synced(&store);

        let key_set = keys.key_set("sessions", KeyType::SymmetricAead).await.unwrap();
        let ciphertext = key_set.encrypt(b"payload").unwrap();

        assert_eq!(keys.rotate("sessions", KeyType::SymmetricAead).await.unwrap(), 2);
        assert_eq!(key_set.active_id(), Some(2));
        assert_eq!(key_set.all_versions().unwrap().len(), 2);
        assert_eq!(key_set.authenticate_and_decrypt(&ciphertext).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = synced(&store);

        let err = keys.key_set("bad.name", KeyType::SymmetricAead).await.unwrap_err();
        assert!(matches!(err, KeyError::InvalidName(_)));
        assert_eq!(store.current_version().await, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_wrapped_as_creation_failure() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = synced(&store);
        store.fail_next_gets(1);

        match keys.key_set("sessions", KeyType::SymmetricAead).await {
            Err(KeyError::CreationFailed { name, source }) => {
                assert_eq!(name, "sessions");
                assert!(matches!(*source, KeyError::BackendUnavailable(_)));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_on_initialized_set_generates_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        let writer = synced(&store);
        writer.ensure_key_set("oidc-keys", KeyType::AsymmetricSigning).await.unwrap();
        let version = store.current_version().await;

        // Any key generation with this modulus would fail
        let reader = SyncedKeyStore::with_options(
            store.clone(),
            "keyward-system",
            "keyward-keys",
            SyncOptions {
                rsa_bits: 1024,
                ..fast_options()
            },
        );

        assert_eq!(reader.ensure_key_set("oidc-keys", KeyType::AsymmetricSigning).await.unwrap(), 1);
        let key_set = reader.key_set("oidc-keys", KeyType::AsymmetricSigning).await.unwrap();
        assert_eq!(key_set.active_id(), Some(1));
        assert_eq!(store.current_version().await, version);

        let err = reader.rotate("oidc-keys", KeyType::AsymmetricSigning).await.unwrap_err();
        assert!(matches!(err, KeyError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let store = Arc::new(MemoryObjectStore::new());
        let keys = Arc::new(synced(&store));
        let mut state = keys.watch_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn({
            let keys = keys.clone();
            async move { keys.watch_forever(shutdown_rx).await }
        });

        state.wait_for(|s| *s == WatchState::Watching).await.unwrap();
        shutdown_tx.send(true).unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), WatchState::Stopped);
    }
}
