//! Key management for Keyward services
//!
//! Named, versioned key sets for signing (RSA) and authenticated encryption
//! (XChaCha20-Poly1305), persisted in a single versioned object that several
//! processes share. Each process keeps an in-memory view of the object in
//! sync by listing and watching it.
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


pub mod aead_key;
pub mod cache;
pub mod codec;
pub mod error;
pub mod jwks;
pub mod key;
pub mod key_set;
pub mod key_store;
pub mod key_types;
pub mod local_store;
pub mod memory_store;
pub mod object_store;
pub mod retry;
pub mod rsa_key;
pub mod service_integration;
pub mod synced_store;

pub use aead_key::AeadKey;
pub use cache::SyncedCache;
pub use error::{KeyError, KeyResult};
pub use jwks::{Jwk, Jwks};
pub use key::Key;
pub use key_set::KeySet;
pub use key_store::KeyStore;
pub use key_types::{EncryptedEnvelope, KeyId, KeyRecord, KeySetRecord, KeyType};
pub use local_store::LocalObjectStore;
pub use memory_store::MemoryObjectStore;
pub use object_store::{ObjectList, ObjectStore, StoredObject, WatchEvent, WatchStream};
pub use retry::RetryConfig;
pub use rsa_key::{PublicKey, RsaSigningKey, Signer};
pub use service_integration::*;
pub use synced_store::{SyncOptions, SyncedKeyStore, WatchState};
