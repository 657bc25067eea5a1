//! Key type definitions and persisted records
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
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one key version within a key set
pub type KeyId = i32;

/// Key type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// RSA signing key (PKCS#1 v1.5, SHA-256)
    AsymmetricSigning,
    /// XChaCha20-Poly1305 secret key
    SymmetricAead,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::AsymmetricSigning => "asymmetric_signing",
            KeyType::SymmetricAead => "symmetric_aead",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa" | "asymmetric_signing" => Ok(KeyType::AsymmetricSigning),
            "aead" | "secretbox" | "symmetric_aead" => Ok(KeyType::SymmetricAead),
            other => Err(KeyError::Configuration(format!("Unknown key type: {}", other))),
        }
    }
}

/// One persisted key version. Never mutated after creation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// PKCS#1 DER private key, or the raw 32-byte secret
    #[serde(with = "base64_bytes")]
    pub secret: Vec<u8>,
    pub created_at: i64,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("secret", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// One named key set as persisted in the backing object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetRecord {
    /// Zero while the key set is uninitialized
    #[serde(default)]
    pub active_id: KeyId,
    #[serde(default)]
    pub keys: Vec<KeyRecord>,
}

/// AEAD construction used to produce an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[serde(rename = "xchacha20poly1305")]
    XChaCha20Poly1305,
}

/// Wire form of one ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub method: EncryptionMethod,
    pub key_id: KeyId,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn to_bytes(&self) -> KeyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Any parse failure is reported as an authentication failure.
    pub fn from_bytes(bytes: &[u8]) -> KeyResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| KeyError::AuthenticationFailed)
    }
}

/// Serde adapter storing byte fields as standard base64 strings
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
