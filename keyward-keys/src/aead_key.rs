//! Symmetric authenticated-encryption keys (XChaCha20-Poly1305)
//!
//! Every call to [`AeadKey::encrypt`] draws a fresh 24-byte nonce from the
//! OS RNG. The extended nonce is large enough that random nonces do not
//! collide in practice, so no counter state has to be persisted.
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
use crate::key_types::{EncryptedEnvelope, EncryptionMethod, KeyId, KeyRecord, KeyType};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// 256-bit secret key with its persisted record
#[derive(Clone)]
pub struct AeadKey {
    record: KeyRecord,
    secret: Zeroizing<[u8; KEY_LEN]>,
}

impl AeadKey {
    pub fn generate(id: KeyId) -> Self {
        let mut secret = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut secret[..]);

        let record = KeyRecord {
            id,
            key_type: KeyType::SymmetricAead,
            secret: secret.to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        };

        Self { record, secret }
    }

    pub fn load(record: KeyRecord) -> KeyResult<Self> {
        if record.key_type != KeyType::SymmetricAead {
            return Err(KeyError::CorruptRecord(format!(
                "key {} has type {}, expected {}",
                record.id,
                record.key_type,
                KeyType::SymmetricAead
            )));
        }
        if record.secret.len() != KEY_LEN {
            return Err(KeyError::CorruptRecord(format!(
                "key {}: expected {} byte secret, was {}",
                record.id,
                KEY_LEN,
                record.secret.len()
            )));
        }

        let mut secret = Zeroizing::new([0u8; KEY_LEN]);
        secret.copy_from_slice(&record.secret);
        Ok(Self { record, secret })
    }

    pub fn id(&self) -> KeyId {
        self.record.id
    }

    pub fn record(&self) -> &KeyRecord {
        &self.record
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.secret[..]))
    }

    /// Seal `plaintext` under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> KeyResult<EncryptedEnvelope> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| KeyError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedEnvelope {
            method: EncryptionMethod::XChaCha20Poly1305,
            key_id: self.record.id,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Seal `plaintext` and serialize the envelope
    pub fn encrypt(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        self.seal(plaintext)?.to_bytes()
    }

    /// Open an envelope produced by this key
    pub fn open(&self, envelope: &EncryptedEnvelope) -> KeyResult<Vec<u8>> {
        if envelope.method != EncryptionMethod::XChaCha20Poly1305
            || envelope.key_id != self.record.id
            || envelope.nonce.len() != NONCE_LEN
        {
            return Err(KeyError::AuthenticationFailed);
        }

        self.cipher()
            .decrypt(XNonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| KeyError::AuthenticationFailed)
    }

    /// Parse a serialized envelope and open it
    pub fn authenticate_and_decrypt(&self, ciphertext: &[u8]) -> KeyResult<Vec<u8>> {
        let envelope = EncryptedEnvelope::from_bytes(ciphertext)?;
        self.open(&envelope)
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadKey").field("id", &self.record.id).finish()
    }
}
