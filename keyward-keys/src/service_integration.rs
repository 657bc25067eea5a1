//! Service integration helpers for using key management in services
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
use crate::key_types::KeyType;
use crate::local_store::LocalObjectStore;
use crate::memory_store::MemoryObjectStore;
use crate::object_store::ObjectStore;
use crate::retry::RetryConfig;
use crate::synced_store::{SyncOptions, SyncedKeyStore};
use keyward_config::{KeyKind, KeywardConfig, StoreBackend};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

impl From<KeyKind> for KeyType {
    fn from(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Rsa => KeyType::AsymmetricSigning,
            KeyKind::Aead => KeyType::SymmetricAead,
        }
    }
}

/// Open the object store backend selected by configuration
pub async fn open_object_store(config: &KeywardConfig) -> KeyResult<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory object store, key sets will not survive a restart");
            Arc::new(MemoryObjectStore::new())
        }
        StoreBackend::Local => {
            info!(path = %config.store_path, "Initializing local object store");
            let local = LocalObjectStore::new(&config.store_path, None)
                .await?
                .with_poll_interval(config.poll_interval());
            Arc::new(local)
        }
    };

    Ok(store)
}

/// Initialize key store for a service
pub async fn init_key_store(config: &KeywardConfig) -> KeyResult<Arc<SyncedKeyStore>> {
    let store = open_object_store(config).await?;
    let options = SyncOptions {
        rsa_bits: config.rsa_bits,
        watch_backoff: RetryConfig::fixed(config.watch_backoff()),
        ..SyncOptions::default()
    };

    info!(
        backend = store.store_type(),
        namespace = %config.namespace,
        object = %config.object_name,
        "Initializing key store"
    );

    Ok(Arc::new(SyncedKeyStore::with_options(
        store,
        &config.namespace,
        &config.object_name,
        options,
    )))
}

/// Running watch loop of a [`SyncedKeyStore`]
pub struct WatchHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<KeyResult<()>>,
}

impl WatchHandle {
    /// Cancel the watch loop and wait for it to finish
    pub async fn stop(self) -> KeyResult<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| KeyError::BackendUnavailable(format!("watch task failed: {}", e)))?
    }
}

/// Run the watch loop of `key_store` on a new task
pub fn spawn_watch(key_store: Arc<SyncedKeyStore>) -> WatchHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { key_store.watch_forever(shutdown_rx).await });
    WatchHandle { shutdown, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_store::KeyStore;
    use crate::synced_store::WatchState;

    fn memory_config() -> KeywardConfig {
        KeywardConfig::from_vars(vec![(
            "KEYWARD_STORE_BACKEND".to_string(),
            "memory".to_string(),
        )])
        .unwrap()
    }

    #[test]
    fn test_key_kind_conversion() {
        assert_eq!(KeyType::from(KeyKind::Rsa), KeyType::AsymmetricSigning);
        assert_eq!(KeyType::from(KeyKind::Aead), KeyType::SymmetricAead);
    }

    #[tokio::test]
    async fn test_init_memory_store() {
        let key_store = init_key_store(&memory_config()).await.unwrap();
        let watch = spawn_watch(key_store.clone());

        let mut state = key_store.watch_state();
        state.wait_for(|s| *s == WatchState::Watching).await.unwrap();

        let key_set = key_store
            .key_set("sessions", KeyType::SymmetricAead)
            .await
            .unwrap();
        assert_eq!(key_set.active_id(), Some(1));

        watch.stop().await.unwrap();
        assert_eq!(*state.borrow(), WatchState::Stopped);
    }

    #[tokio::test]
    async fn test_init_local_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = KeywardConfig::from_vars(vec![(
            "KEYWARD_STORE_PATH".to_string(),
            dir.path().display().to_string(),
        )])
        .unwrap();

        let store = open_object_store(&config).await.unwrap();
        assert_eq!(store.store_type(), "local");
    }
}
