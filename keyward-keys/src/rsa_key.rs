//! RSA signing keys
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
use crate::jwks::Jwk;
use crate::key_types::{KeyId, KeyRecord, KeyType};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer as _, Verifier as _};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::sync::Arc;

/// Smallest modulus we will generate
pub const MIN_RSA_BITS: usize = 2048;

/// Default modulus size for new keys
pub const DEFAULT_RSA_BITS: usize = 2048;

/// RSA private key with its persisted record
#[derive(Clone)]
pub struct RsaSigningKey {
    record: KeyRecord,
    key: Arc<RsaPrivateKey>,
}

impl RsaSigningKey {
    /// Generate a fresh key with the given id
    pub fn generate(id: KeyId, bits: usize) -> KeyResult<Self> {
        if bits < MIN_RSA_BITS {
            return Err(KeyError::Configuration(format!(
                "RSA modulus must be at least {} bits, got {}",
                MIN_RSA_BITS, bits
            )));
        }

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| KeyError::Crypto(format!("RSA key generation failed: {}", e)))?;
        let der = key
            .to_pkcs1_der()
            .map_err(|e| KeyError::Crypto(format!("PKCS#1 encoding failed: {}", e)))?;

        let record = KeyRecord {
            id,
            key_type: KeyType::AsymmetricSigning,
            secret: der.as_bytes().to_vec(),
            created_at: chrono::Utc::now().timestamp(),
        };

        Ok(Self {
            record,
            key: Arc::new(key),
        })
    }

    /// Load a key from its persisted record
    pub fn load(record: KeyRecord) -> KeyResult<Self> {
        if record.key_type != KeyType::AsymmetricSigning {
            return Err(KeyError::CorruptRecord(format!(
                "key {} has type {}, expected {}",
                record.id,
                record.key_type,
                KeyType::AsymmetricSigning
            )));
        }

        let key = RsaPrivateKey::from_pkcs1_der(&record.secret)
            .map_err(|_| KeyError::CorruptRecord(format!("key {} is not valid PKCS#1", record.id)))?;
        key.validate()
            .map_err(|_| KeyError::CorruptRecord(format!("key {} failed validation", record.id)))?;

        Ok(Self {
            record,
            key: Arc::new(key),
        })
    }

    pub fn id(&self) -> KeyId {
        self.record.id
    }

    pub fn record(&self) -> &KeyRecord {
        &self.record
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.key.to_public_key(),
        }
    }

    pub fn signer(&self) -> Signer {
        Signer {
            key_id: self.record.id,
            key: SigningKey::<Sha256>::new((*self.key).clone()),
        }
    }
}

impl fmt::Debug for RsaSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaSigningKey")
            .field("id", &self.record.id)
            .field("bits", &(self.key.size() * 8))
            .finish()
    }
}

/// Public half of a signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
}

impl PublicKey {
    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// Check a PKCS#1 v1.5 / SHA-256 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> KeyResult<()> {
        let signature = Signature::try_from(signature)
            .map_err(|_| KeyError::Crypto("Malformed signature".to_string()))?;
        VerifyingKey::<Sha256>::new(self.key.clone())
            .verify(message, &signature)
            .map_err(|_| KeyError::Crypto("Signature verification failed".to_string()))
    }

    /// Export as an RS256 JSON Web Key
    pub fn to_jwk(&self, key_id: KeyId) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            kid: key_id.to_string(),
            alg: "RS256".to_string(),
            use_field: crate::jwks::KeyUse::Sig,
            n: URL_SAFE_NO_PAD.encode(self.key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(self.key.e().to_bytes_be()),
        }
    }
}

/// Signing handle for one key version. Produces RS256 signatures.
#[derive(Clone)]
pub struct Signer {
    key_id: KeyId,
    key: SigningKey<Sha256>,
}

impl Signer {
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Hash `message` with SHA-256 and sign the digest
    pub fn sign(&self, message: &[u8]) -> KeyResult<Vec<u8>> {
        let signature = self
            .key
            .try_sign(message)
            .map_err(|e| KeyError::Crypto(format!("Signing failed: {}", e)))?;
        Ok(signature.to_vec())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("key_id", &self.key_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn shared_key() -> &'static RsaSigningKey {
        static KEY: OnceLock<RsaSigningKey> = OnceLock::new();
        KEY.get_or_init(|| RsaSigningKey::generate(1, DEFAULT_RSA_BITS).unwrap())
    }

    #[test]
    fn test_generate_rejects_small_modulus() {
        let err = RsaSigningKey::generate(1, 1024).unwrap_err();
        assert!(matches!(err, KeyError::Configuration(_)));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = shared_key();
        let signer = key.signer();
        assert_eq!(signer.key_id(), 1);
        let signature = signer.sign(b"header.payload").unwrap();

        let public = key.public_key();
        assert_eq!(public.bits(), 2048);
        public.verify(b"header.payload", &signature).unwrap();
        assert!(public.verify(b"header.payload2", &signature).is_err());
    }

    #[test]
    fn test_record_reloads() {
        let key = shared_key();
        let loaded = RsaSigningKey::load(key.record().clone()).unwrap();

        assert_eq!(loaded.id(), 1);
        assert_eq!(loaded.public_key(), key.public_key());

        let signature = loaded.signer().sign(b"data").unwrap();
        key.public_key().verify(b"data", &signature).unwrap();
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let mut record = shared_key().record().clone();
        record.secret.truncate(40);

        let err = RsaSigningKey::load(record).unwrap_err();
        assert!(matches!(err, KeyError::CorruptRecord(_)));
    }

    #[test]
    fn test_jwk_export() {
        let jwk = shared_key().public_key().to_jwk(7);
        assert_eq!(jwk.kid, "7");
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.e, "AQAB");
        assert!(!jwk.n.contains('='));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let rendered = format!("{:?}", shared_key().record());
        assert!(rendered.contains("<redacted>"));
    }
}
