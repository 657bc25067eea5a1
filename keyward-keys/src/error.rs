//! Error types for key management
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


use crate::key_types::KeyType;
use thiserror::Error;

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    /// The key set exists but has no active key yet. Callers may retry.
    #[error("Key set not initialized: {0}")]
    NotInitialized(String),

    /// The operation is not supported by this kind of key.
    #[error("Key type {key_type} does not support {operation}")]
    UnsupportedOperation {
        key_type: KeyType,
        operation: &'static str,
    },

    #[error("Wrong key type: expected {expected}, found {actual}")]
    WrongKeyType { expected: KeyType, actual: KeyType },

    /// Deliberately carries no detail about which check failed.
    #[error("Encrypted data not valid")]
    AuthenticationFailed,

    #[error("Corrupt key record: {0}")]
    CorruptRecord(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Error creating key set {name}: {source}")]
    CreationFailed {
        name: String,
        #[source]
        source: Box<KeyError>,
    },

    #[error("Invalid key set name: {0:?}")]
    InvalidName(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting write to {object}: expected version {expected}, found {actual}")]
    Conflict {
        object: String,
        expected: String,
        actual: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl KeyError {
    /// Whether a read-modify-write should be restarted after this error.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, KeyError::Conflict { .. } | KeyError::AlreadyExists(_))
    }
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
