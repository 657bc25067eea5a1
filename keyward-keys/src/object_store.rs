//! Versioned object store interface
//!
//! The synchronized key store persists every key set inside a single
//! versioned object. This trait describes the operations it needs from the
//! system holding that object, and can be implemented by different backends:
//! - In-memory store (tests, single process)
//! - Local encrypted file store
//! - Kubernetes Secrets or any other API with resource versions and watches
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


use crate::error::KeyResult;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

/// A named object with string keys and opaque byte values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub namespace: String,
    pub name: String,
    /// Opaque version token assigned by the store. Empty for objects that
    /// have not been written yet.
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl StoredObject {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// `namespace/name`, for logs and errors
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Result of listing the watched object
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<StoredObject>,
    /// Version at which the list was taken; watches resume from here
    pub resource_version: String,
}

/// Change notification delivered by [`ObjectStore::watch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(StoredObject),
    Modified(StoredObject),
    /// Carries the object as of its deletion, with the deletion version
    Deleted(StoredObject),
    /// Version checkpoint only
    Bookmark(String),
    Error(String),
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Trait for versioned object store backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object, or `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> KeyResult<Option<StoredObject>>;

    /// Create the object. Fails with `AlreadyExists` if it is present.
    async fn create(&self, object: StoredObject) -> KeyResult<StoredObject>;

    /// Replace the object. When `object.resource_version` is non-empty the
    /// write only succeeds if it still matches the stored version, otherwise
    /// it fails with `Conflict`.
    async fn update(&self, object: StoredObject) -> KeyResult<StoredObject>;

    /// Delete the object
    async fn delete(&self, namespace: &str, name: &str) -> KeyResult<()>;

    /// List the object with the given name (zero or one item)
    async fn list(&self, namespace: &str, name: &str) -> KeyResult<ObjectList>;

    /// Stream changes to the named object newer than `resource_version`.
    /// The stream ends when the store closes the watch.
    async fn watch(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> KeyResult<WatchStream>;

    /// Get the backend type name
    fn store_type(&self) -> &str;
}
