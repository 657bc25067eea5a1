//! A single key version
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


use crate::aead_key::AeadKey;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyId, KeyRecord, KeyType};
use crate::rsa_key::{PublicKey, RsaSigningKey, Signer};

/// One key version. Operations that a variant does not support return
/// [`KeyError::UnsupportedOperation`].
#[derive(Debug, Clone)]
pub enum Key {
    AsymmetricSigning(RsaSigningKey),
    SymmetricAead(AeadKey),
}

impl Key {
    /// Generate a new key of `key_type` with the given id
    pub fn generate(key_type: KeyType, id: KeyId, rsa_bits: usize) -> KeyResult<Self> {
        match key_type {
            KeyType::AsymmetricSigning => {
                RsaSigningKey::generate(id, rsa_bits).map(Key::AsymmetricSigning)
            }
            KeyType::SymmetricAead => Ok(Key::SymmetricAead(AeadKey::generate(id))),
        }
    }

    /// Decode a persisted record back into a usable key
    pub fn from_record(record: KeyRecord) -> KeyResult<Self> {
        match record.key_type {
            KeyType::AsymmetricSigning => RsaSigningKey::load(record).map(Key::AsymmetricSigning),
            KeyType::SymmetricAead => AeadKey::load(record).map(Key::SymmetricAead),
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Key::AsymmetricSigning(_) => KeyType::AsymmetricSigning,
            Key::SymmetricAead(_) => KeyType::SymmetricAead,
        }
    }

    pub fn id(&self) -> KeyId {
        self.record().id
    }

    /// Epoch seconds at which this version was generated
    pub fn created_at(&self) -> i64 {
        self.record().created_at
    }

    pub fn public_key(&self) -> KeyResult<PublicKey> {
        match self {
            Key::AsymmetricSigning(key) => Ok(key.public_key()),
            Key::SymmetricAead(_) => Err(self.unsupported("public_key")),
        }
    }

    pub fn signer(&self) -> KeyResult<Signer> {
        match self {
            Key::AsymmetricSigning(key) => Ok(key.signer()),
            Key::SymmetricAead(_) => Err(self.unsupported("signer")),
        }
    }

    pub fn as_aead(&self) -> Option<&AeadKey> {
        match self {
            Key::SymmetricAead(key) => Some(key),
            Key::AsymmetricSigning(_) => None,
        }
    }

    /// Persisted form of this version
    pub fn record(&self) -> &KeyRecord {
        match self {
            Key::AsymmetricSigning(key) => key.record(),
            Key::SymmetricAead(key) => key.record(),
        }
    }

    fn unsupported(&self, operation: &'static str) -> KeyError {
        KeyError::UnsupportedOperation {
            key_type: self.key_type(),
            operation,
        }
    }
}
