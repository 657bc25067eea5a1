//! In-memory view of the backing object
//!
//! Updates are applied only when their resource version is strictly newer
//! than the last one applied, so replays and out-of-order deliveries from
//! the watch cannot roll the cache back.
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


use crate::codec;
use crate::key_set::KeySetEntry;
use crate::object_store::StoredObject;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Default)]
struct CacheState {
    key_sets: HashMap<String, Arc<KeySetEntry>>,
    resource_version: i64,
}

/// Shared cache of decoded key sets
#[derive(Default)]
pub struct SyncedCache {
    state: Mutex<CacheState>,
}

impl SyncedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resource version of the last applied update or delete (0 if none)
    pub fn resource_version(&self) -> i64 {
        self.lock().resource_version
    }

    /// Names of the key sets currently cached
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().key_sets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace the cached key sets with the contents of `object` if its
    /// version is newer than the last applied. Returns whether it was applied.
    pub fn apply_update(&self, object: &StoredObject) -> bool {
        let Some(version) = parse_version(&object.resource_version) else {
            return false;
        };
        if !self.is_newer(version) {
            debug!(version, "Discarding stale object update");
            return false;
        }

        // Key loading is the expensive part; keep it outside the lock.
        let decoded = codec::decode_object(object);

        let mut state = self.lock();
        if version <= state.resource_version {
            debug!(version, "Discarding stale object update");
            return false;
        }

        state.key_sets.retain(|name, entry| {
            if decoded.contains_key(name) {
                true
            } else {
                entry.clear();
                false
            }
        });
        for (name, key_set) in decoded {
            match state.key_sets.get(&name) {
                Some(entry) => entry.replace(key_set),
                None => {
                    state
                        .key_sets
                        .insert(name, Arc::new(KeySetEntry::new(key_set)));
                }
            }
        }
        state.resource_version = version;

        debug!(version, key_sets = state.key_sets.len(), "Applied object update");
        true
    }

    /// Clear the cache if `resource_version` is newer than the last applied.
    /// Returns whether it was applied.
    pub fn apply_delete(&self, resource_version: &str) -> bool {
        let Some(version) = parse_version(resource_version) else {
            return false;
        };

        let mut state = self.lock();
        if version <= state.resource_version {
            debug!(version, "Discarding stale object deletion");
            return false;
        }

        for entry in state.key_sets.values() {
            entry.clear();
        }
        state.key_sets.clear();
        state.resource_version = version;

        info!(version, "Backing object deleted, key sets cleared");
        true
    }

    pub(crate) fn entry(&self, name: &str) -> Option<Arc<KeySetEntry>> {
        self.lock().key_sets.get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, name: &str, key_set: crate::key_set::KeySetState) {
        self.lock()
            .key_sets
            .insert(name.to_string(), Arc::new(KeySetEntry::new(key_set)));
    }

    fn is_newer(&self, version: i64) -> bool {
        version > self.lock().resource_version
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_version(resource_version: &str) -> Option<i64> {
    match resource_version.parse::<i64>() {
        Ok(version) => Some(version),
        Err(e) => {
            warn!(resource_version, error = %e, "Discarding update with unparseable resource version");
            None
        }
    }
}
