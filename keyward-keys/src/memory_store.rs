//! In-memory versioned object store
//!
//! Keeps every object in process memory with a store-wide version counter and
//! a bounded change history so that watches can resume from a version. Several
//! [`SyncedKeyStore`](crate::SyncedKeyStore)s sharing one `Arc<MemoryObjectStore>`
//! behave like independent processes sharing one remote object.
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
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Number of change events retained for resuming watches
const HISTORY_LIMIT: usize = 1024;

type ObjectKey = (String, String);

#[derive(Debug, Clone)]
struct Notification {
    /// `None` for store-wide notifications such as bookmarks
    target: Option<ObjectKey>,
    version: u64,
    event: WatchEvent,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<ObjectKey, StoredObject>,
    version: u64,
    history: VecDeque<Notification>,
}

impl MemoryState {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn record(&mut self, notification: Notification, events: &broadcast::Sender<Notification>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(notification.clone());
        // No receivers is fine; there may be no active watch.
        let _ = events.send(notification);
    }
}

/// Process-local object store with resource versions and watches
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<Notification>,
    closer: broadcast::Sender<()>,
    failing_gets: AtomicU32,
    failing_lists: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        let (closer, _) = broadcast::channel(1);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            closer,
            failing_gets: AtomicU32::new(0),
            failing_lists: AtomicU32::new(0),
        }
    }

    /// Latest version assigned by the store
    pub async fn current_version(&self) -> u64 {
        self.state.lock().await.version
    }

    /// Make the next `count` calls to `get` fail as if the store were unreachable
    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `list` fail as if the store were unreachable
    pub fn fail_next_lists(&self, count: u32) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    /// End every open watch stream, as a server-side timeout would
    pub fn close_watches(&self) {
        let _ = self.closer.send(());
    }

    /// Send a bookmark carrying the current version to every open watch
    pub async fn bookmark(&self) {
        let state = self.state.lock().await;
        let _ = self.events.send(Notification {
            target: None,
            version: state.version,
            event: WatchEvent::Bookmark(state.version.to_string()),
        });
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn parse_version(resource_version: &str) -> KeyResult<u64> {
        if resource_version.is_empty() {
            return Ok(0);
        }
        resource_version.parse().map_err(|_| {
            KeyError::BackendUnavailable(format!("invalid resource version {:?}", resource_version))
        })
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, namespace: &str, name: &str) -> KeyResult<Option<StoredObject>> {
        if Self::take_fault(&self.failing_gets) {
            return Err(KeyError::BackendUnavailable(format!(
                "injected failure fetching {}/{}",
                namespace, name
            )));
        }

        let state = self.state.lock().await;
        Ok(state
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, mut object: StoredObject) -> KeyResult<StoredObject> {
        let mut state = self.state.lock().await;
        let key = (object.namespace.clone(), object.name.clone());
        if state.objects.contains_key(&key) {
            return Err(KeyError::AlreadyExists(object.qualified_name()));
        }

        let version = state.next_version();
        object.resource_version = version.to_string();
        state.objects.insert(key.clone(), object.clone());
        state.record(
            Notification {
                target: Some(key),
                version,
                event: WatchEvent::Added(object.clone()),
            },
            &self.events,
        );

        debug!(object = %object.qualified_name(), version, "Object created");
        Ok(object)
    }

    async fn update(&self, mut object: StoredObject) -> KeyResult<StoredObject> {
        let mut state = self.state.lock().await;
        let key = (object.namespace.clone(), object.name.clone());
        let current_version = match state.objects.get(&key) {
            Some(current) => current.resource_version.clone(),
            None => return Err(KeyError::NotFound(object.qualified_name())),
        };

        if !object.resource_version.is_empty() && object.resource_version != current_version {
            return Err(KeyError::Conflict {
                object: object.qualified_name(),
                expected: object.resource_version,
                actual: current_version,
            });
        }

        let version = state.next_version();
        object.resource_version = version.to_string();
        state.objects.insert(key.clone(), object.clone());
        state.record(
            Notification {
                target: Some(key),
                version,
                event: WatchEvent::Modified(object.clone()),
            },
            &self.events,
        );

        debug!(object = %object.qualified_name(), version, "Object updated");
        Ok(object)
    }

    async fn delete(&self, namespace: &str, name: &str) -> KeyResult<()> {
        let mut state = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        let mut object = state
            .objects
            .remove(&key)
            .ok_or_else(|| KeyError::NotFound(format!("{}/{}", namespace, name)))?;

        let version = state.next_version();
        object.resource_version = version.to_string();
        state.record(
            Notification {
                target: Some(key),
                version,
                event: WatchEvent::Deleted(object),
            },
            &self.events,
        );

        debug!(namespace, name, version, "Object deleted");
        Ok(())
    }

    async fn list(&self, namespace: &str, name: &str) -> KeyResult<ObjectList> {
        if Self::take_fault(&self.failing_lists) {
            return Err(KeyError::BackendUnavailable(format!(
                "injected failure listing {}/{}",
                namespace, name
            )));
        }

        let state = self.state.lock().await;
        let items = state
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .into_iter()
            .collect();

        Ok(ObjectList {
            items,
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> KeyResult<WatchStream> {
        let from = Self::parse_version(resource_version)?;
        let key = (namespace.to_string(), name.to_string());

        // Subscribe under the state lock so no event falls between backlog and live feed
        let (backlog, mut events, mut closer) = {
            let state = self.state.lock().await;
            if let Some(oldest) = state.history.front() {
                if from + 1 < oldest.version {
                    return Err(KeyError::BackendUnavailable(format!(
                        "resource version {} is too old",
                        from
                    )));
                }
            }

            let backlog: Vec<Notification> = state
                .history
                .iter()
                .filter(|n| n.version > from && n.target.as_ref() == Some(&key))
                .cloned()
                .collect();
            (backlog, self.events.subscribe(), self.closer.subscribe())
        };

        let (tx, rx) = mpsc::channel::<WatchEvent>(64);

        tokio::spawn(async move {
            let mut last = from;
            for notification in backlog {
                last = notification.version;
                if tx.send(notification.event).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = closer.recv() => {
                        debug!("Watch closed by store");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("Watch receiver dropped, stopping");
                        break;
                    }
                    received = events.recv() => match received {
                        Ok(notification) => {
                            let relevant = match &notification.target {
                                Some(target) => *target == key && notification.version > last,
                                None => true,
                            };
                            if !relevant {
                                continue;
                            }
                            last = last.max(notification.version);
                            if tx.send(notification.event).await.is_err() {
                                debug!("Watch receiver dropped, stopping");
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Watch fell behind the event feed");
                            let _ = tx
                                .send(WatchEvent::Error(format!("watch lagged by {} events", skipped)))
                                .await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn object(data: &[(&str, &[u8])]) -> StoredObject {
        let mut obj = StoredObject::new("ns", "keys");
        for (k, v) in data {
            obj.data.insert(k.to_string(), v.to_vec());
        }
        obj
    }

    #[tokio::test]
    async fn test_versions_increase_on_every_write() {
        let store = MemoryObjectStore::new();
        assert!(store.get("ns", "keys").await.unwrap().is_none());

        let created = store.create(object(&[("a", b"1")])).await.unwrap();
        assert_eq!(created.resource_version, "1");

        let updated = store.update(created.clone()).await.unwrap();
        assert_eq!(updated.resource_version, "2");

        let err = store.create(object(&[])).await.unwrap_err();
        assert!(matches!(err, KeyError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryObjectStore::new();
        let created = store.create(object(&[])).await.unwrap();
        store.update(created.clone()).await.unwrap();

        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, KeyError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_watch_replays_from_version() {
        let store = MemoryObjectStore::new();
        let created = store.create(object(&[("a", b"1")])).await.unwrap();
        store.update(created).await.unwrap();

        let mut watch = store.watch("ns", "keys", "1").await.unwrap();
        match watch.next().await {
            Some(WatchEvent::Modified(obj)) => assert_eq!(obj.resource_version, "2"),
            other => panic!("unexpected event {:?}", other),
        }

        store.delete("ns", "keys").await.unwrap();
        match watch.next().await {
            Some(WatchEvent::Deleted(obj)) => assert_eq!(obj.resource_version, "3"),
            other => panic!("unexpected event {:?}", other),
        }

        store.close_watches();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_watch_releases_feed() {
        let store = MemoryObjectStore::new();
        store.create(object(&[])).await.unwrap();

        let watch = store.watch("ns", "keys", "1").await.unwrap();
        assert_eq!(store.events.receiver_count(), 1);
        drop(watch);

        // No further writes: the forwarder has to notice on its own
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.events.receiver_count() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch forwarder still running");
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next_lists(1);

        assert!(matches!(
            store.list("ns", "keys").await,
            Err(KeyError::BackendUnavailable(_))
        ));
        assert!(store.list("ns", "keys").await.is_ok());
    }
}
