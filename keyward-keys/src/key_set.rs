//! Named, versioned key sets
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
use crate::error::{KeyError, KeyResult};
use crate::jwks::Jwks;
use crate::key::Key;
use crate::key_types::{EncryptedEnvelope, KeyId, KeyType};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Decoded contents of one key set
#[derive(Debug, Clone, Default)]
pub(crate) struct KeySetState {
    pub active_id: KeyId,
    pub versions: BTreeMap<KeyId, Key>,
}

impl KeySetState {
    fn active_key(&self) -> Option<&Key> {
        self.versions.get(&self.active_id)
    }
}

/// Cache slot for one key set. Replaced wholesale on every applied update.
#[derive(Debug, Default)]
pub(crate) struct KeySetEntry {
    state: Mutex<KeySetState>,
}

impl KeySetEntry {
    pub fn new(state: KeySetState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn replace(&self, state: KeySetState) {
        *self.lock() = state;
    }

    pub fn clear(&self) {
        *self.lock() = KeySetState::default();
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> KeySetState {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeySetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a named key set.
///
/// The handle reads through to the store's cache, so a rotation or deletion
/// applied by the watch loop is visible to every handle for that name. The
/// handle never performs I/O.
#[derive(Clone)]
pub struct KeySet {
    name: String,
    cache: Arc<SyncedCache>,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("name", &self.name)
            .field("active_id", &self.active_id())
            .finish()
    }
}

impl KeySet {
    pub(crate) fn new(name: &str, cache: Arc<SyncedCache>) -> Self {
        Self {
            name: name.to_string(),
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the active version, if the key set is initialized
    pub fn active_id(&self) -> Option<KeyId> {
        let entry = self.cache.entry(&self.name)?;
        let id = entry.lock().active_key().map(Key::id);
        id
    }

    /// The key version new operations should use
    pub fn active_key(&self) -> KeyResult<Key> {
        self.entry()?
            .lock()
            .active_key()
            .cloned()
            .ok_or_else(|| self.not_initialized())
    }

    /// Every version currently held, ascending by id
    pub fn all_versions(&self) -> KeyResult<Vec<Key>> {
        Ok(self.entry()?.lock().versions.values().cloned().collect())
    }

    /// Encrypt with the active version
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let key = self.active_key()?;
        match key.as_aead() {
            Some(aead) => aead.encrypt(plaintext),
            None => Err(KeyError::WrongKeyType {
                expected: KeyType::SymmetricAead,
                actual: key.key_type(),
            }),
        }
    }

    /// Decrypt with whichever version produced `ciphertext`
    pub fn authenticate_and_decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        let envelope = EncryptedEnvelope::from_bytes(ciphertext)?;
        let key = self
            .entry()?
            .lock()
            .versions
            .get(&envelope.key_id)
            .cloned()
            .ok_or(KeyError::AuthenticationFailed)?;

        match key.as_aead() {
            Some(aead) => aead.open(&envelope),
            None => Err(KeyError::WrongKeyType {
                expected: KeyType::SymmetricAead,
                actual: key.key_type(),
            }),
        }
    }

    /// Public halves of every signing version, for a JWKS endpoint
    pub fn public_key_set(&self) -> KeyResult<Jwks> {
        Ok(Jwks::from_keys(&self.all_versions()?))
    }

    fn entry(&self) -> KeyResult<Arc<KeySetEntry>> {
        self.cache
            .entry(&self.name)
            .ok_or_else(|| self.not_initialized())
    }

    fn not_initialized(&self) -> KeyError {
        KeyError::NotInitialized(self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aead_state(ids: &[KeyId], active_id: KeyId) -> KeySetState {
        let versions = ids
            .iter()
            .map(|&id| (id, Key::generate(KeyType::SymmetricAead, id, 0).unwrap()))
            .collect();
        KeySetState {
            active_id,
            versions,
        }
    }

    fn key_set_with(state: KeySetState) -> KeySet {
        let cache = Arc::new(SyncedCache::new());
        cache.insert_for_test("secrets", state);
        KeySet::new("secrets", cache)
    }

    #[test]
    fn test_missing_key_set_is_not_initialized() {
        let key_set = KeySet::new("absent", Arc::new(SyncedCache::new()));
        assert!(matches!(key_set.active_key(), Err(KeyError::NotInitialized(_))));
        assert!(matches!(key_set.encrypt(b"x"), Err(KeyError::NotInitialized(_))));
        assert_eq!(key_set.active_id(), None);
    }

    #[test]
    fn test_dangling_active_id_is_not_initialized() {
        let key_set = key_set_with(aead_state(&[1, 2], 7));
        assert!(matches!(key_set.active_key(), Err(KeyError::NotInitialized(_))));
        assert_eq!(key_set.all_versions().unwrap().len(), 2);
    }

    #[test]
    fn test_versions_are_sorted() {
        let key_set = key_set_with(aead_state(&[5, 1, 3], 5));
        let ids: Vec<KeyId> = key_set.all_versions().unwrap().iter().map(Key::id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_decrypt_selects_version_by_envelope() {
        let state = aead_state(&[1, 2], 2);
        let old_ciphertext = state.versions[&1].as_aead().unwrap().encrypt(b"old").unwrap();
        let key_set = key_set_with(state);

        let new_ciphertext = key_set.encrypt(b"new").unwrap();
        assert_eq!(key_set.authenticate_and_decrypt(&old_ciphertext).unwrap(), b"old");
        assert_eq!(key_set.authenticate_and_decrypt(&new_ciphertext).unwrap(), b"new");
    }

    #[test]
    fn test_unknown_key_id_fails_authentication() {
        let other = Key::generate(KeyType::SymmetricAead, 9, 0).unwrap();
        let ciphertext = other.as_aead().unwrap().encrypt(b"data").unwrap();
        let key_set = key_set_with(aead_state(&[1], 1));

        assert!(matches!(
            key_set.authenticate_and_decrypt(&ciphertext),
            Err(KeyError::AuthenticationFailed)
        ));
        assert!(matches!(
            key_set.authenticate_and_decrypt(b"not an envelope"),
            Err(KeyError::AuthenticationFailed)
        ));
    }

    fn rsa_state(id: KeyId) -> KeySetState {
        let key = Key::generate(KeyType::AsymmetricSigning, id, 2048).unwrap();
        KeySetState {
            active_id: id,
            versions: BTreeMap::from([(id, key)]),
        }
    }

    #[test]
    fn test_encrypt_with_signing_key_is_wrong_type() {
        let key_set = key_set_with(rsa_state(1));
        assert!(matches!(
            key_set.encrypt(b"data"),
            Err(KeyError::WrongKeyType {
                expected: KeyType::SymmetricAead,
                actual: KeyType::AsymmetricSigning,
            })
        ));
    }

    #[test]
    fn test_decrypt_naming_signing_version_is_wrong_type() {
        // Envelope carries key id 1, which is an RSA version in this set
        let other = Key::generate(KeyType::SymmetricAead, 1, 0).unwrap();
        let ciphertext = other.as_aead().unwrap().encrypt(b"data").unwrap();
        let key_set = key_set_with(rsa_state(1));

        assert!(matches!(
            key_set.authenticate_and_decrypt(&ciphertext),
            Err(KeyError::WrongKeyType {
                expected: KeyType::SymmetricAead,
                actual: KeyType::AsymmetricSigning,
            })
        ));
    }

    #[test]
    fn test_public_key_set_of_symmetric_keys_is_empty() {
        let key_set = key_set_with(aead_state(&[1, 2], 2));
        assert!(key_set.public_key_set().unwrap().keys.is_empty());
    }
}
