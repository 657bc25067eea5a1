//! Key store trait
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
use crate::key_set::KeySet;
use crate::key_types::KeyType;
use async_trait::async_trait;

/// Source of named key sets
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Get the key set `name`, creating it with a first key of `key_type`
    /// if it does not exist yet. `key_type` is ignored for existing sets.
    async fn key_set(&self, name: &str, key_type: KeyType) -> KeyResult<KeySet>;
}
