//! Encoding of key sets into the fields of the backing object
//!
//! Every key set is stored under the field `keyset.<name>` as a JSON
//! [`KeySetRecord`](crate::KeySetRecord). Decoding is lenient: a corrupt key record is skipped,
//! and a corrupt key set is skipped without affecting its siblings.
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
use crate::key::Key;
use crate::key_set::KeySetState;
use crate::key_types::{KeyId, KeyRecord, KeyType};
use crate::object_store::StoredObject;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

pub const KEYSET_PREFIX: &str = "keyset.";

/// Field of the backing object holding key set `name`
pub fn field_name(name: &str) -> String {
    format!("{}{}", KEYSET_PREFIX, name)
}

/// Key set names must be usable as object field suffixes
pub fn validate_name(name: &str) -> KeyResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeyError::InvalidName(name.to_string()))
    }
}

/// Key set as stored, with key records left undecoded
#[derive(Debug, Default, Serialize, Deserialize)]
struct RawKeySetRecord {
    #[serde(default)]
    active_id: KeyId,
    #[serde(default)]
    keys: Vec<serde_json::Value>,
}

/// Decode every key set held by `object`
pub(crate) fn decode_object(object: &StoredObject) -> HashMap<String, KeySetState> {
    let mut key_sets = HashMap::new();

    for (field, value) in &object.data {
        let name = match field.strip_prefix(KEYSET_PREFIX) {
            Some(name) if validate_name(name).is_ok() => name,
            _ => {
                warn!(field = %field, object = %object.qualified_name(), "Ignoring unrecognized object field");
                continue;
            }
        };

        match decode_key_set(name, value) {
            Ok(state) => {
                key_sets.insert(name.to_string(), state);
            }
            Err(e) => {
                warn!(key_set = name, error = %e, "Skipping corrupt key set");
            }
        }
    }

    key_sets
}

/// Decode one key set, skipping key records that fail to load
pub(crate) fn decode_key_set(name: &str, bytes: &[u8]) -> KeyResult<KeySetState> {
    let raw: RawKeySetRecord = serde_json::from_slice(bytes)
        .map_err(|e| KeyError::CorruptRecord(format!("key set {}: {}", name, e)))?;

    let mut state = KeySetState {
        active_id: raw.active_id,
        ..Default::default()
    };

    for value in raw.keys {
        let loaded = serde_json::from_value::<KeyRecord>(value)
            .map_err(|e| KeyError::CorruptRecord(e.to_string()))
            .and_then(Key::from_record);
        match loaded {
            Ok(key) => {
                state.versions.insert(key.id(), key);
            }
            Err(e) => {
                warn!(key_set = name, error = %e, "Skipping corrupt key record");
            }
        }
    }

    Ok(state)
}

/// What writing key set `name` requires
#[derive(Debug)]
pub(crate) enum KeySetChange {
    /// The key set already had a usable active key
    Unchanged(KeyId),
    /// A new version must be added and activated
    NeedsVersion(PendingVersion),
}

/// Stored key set awaiting its next version
#[derive(Debug)]
pub(crate) struct PendingVersion {
    raw: RawKeySetRecord,
    id: KeyId,
    key_type: KeyType,
}

impl PendingVersion {
    /// Id the new version will be written under
    pub fn id(&self) -> KeyId {
        self.id
    }

    /// Add `material` under the reserved id, make it active and encode the
    /// resulting field value
    pub fn finish(mut self, material: &KeyRecord) -> KeyResult<Vec<u8>> {
        if material.key_type != self.key_type {
            return Err(KeyError::WrongKeyType {
                expected: self.key_type,
                actual: material.key_type,
            });
        }
        let record = KeyRecord {
            id: self.id,
            ..material.clone()
        };

        self.raw.keys.push(serde_json::to_value(&record)?);
        self.raw
            .keys
            .sort_by_key(|v| v.get("id").and_then(serde_json::Value::as_i64).unwrap_or(i64::MAX));
        self.raw.active_id = self.id;

        Ok(serde_json::to_vec(&self.raw)?)
    }
}

/// Decide whether the key set stored in `existing` needs a new `key_type`
/// version. With `force` unset nothing changes if a usable active key is
/// already present. Records that fail to decode are carried over unchanged
/// and still count towards the next id.
pub(crate) fn plan_key_version(
    name: &str,
    existing: Option<&[u8]>,
    key_type: KeyType,
    force: bool,
) -> KeyResult<KeySetChange> {
    let raw = match existing {
        Some(bytes) => serde_json::from_slice::<RawKeySetRecord>(bytes)
            .map_err(|e| KeyError::CorruptRecord(format!("key set {}: {}", name, e)))?,
        None => RawKeySetRecord::default(),
    };

    let mut max_id: KeyId = 0;
    let mut active_type: Option<KeyType> = None;
    for value in &raw.keys {
        let id = value
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .and_then(|id| KeyId::try_from(id).ok());
        if let Some(id) = id {
            max_id = max_id.max(id);
        }
        if let Ok(record) = serde_json::from_value::<KeyRecord>(value.clone()) {
            if record.id == raw.active_id && record.id > 0 {
                let record_type = record.key_type;
                if Key::from_record(record).is_ok() {
                    active_type = Some(record_type);
                }
            }
        }
    }

    match active_type {
        Some(_) if !force => return Ok(KeySetChange::Unchanged(raw.active_id)),
        Some(current) if current != key_type => {
            return Err(KeyError::WrongKeyType {
                expected: current,
                actual: key_type,
            });
        }
        _ => {}
    }

    let id = max_id
        .checked_add(1)
        .ok_or_else(|| KeyError::Crypto(format!("key set {} has exhausted its key ids", name)))?;

    Ok(KeySetChange::NeedsVersion(PendingVersion { raw, id, key_type }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::KeySetRecord;

    fn aead_record(id: KeyId) -> KeyRecord {
        let mut record = Key::generate(KeyType::SymmetricAead, id, 0)
            .unwrap()
            .record()
            .clone();
        record.id = id;
        record
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("oidc-keys").is_ok());
        assert!(validate_name("sessions_v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a.b").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_one_corrupt_record_is_skipped() {
        let mut corrupt = aead_record(2);
        corrupt.secret.truncate(5);
        let record = KeySetRecord {
            active_id: 3,
            keys: vec![aead_record(1), corrupt, aead_record(3)],
        };
        let bytes = serde_json::to_vec(&record).unwrap();

        let state = decode_key_set("s", &bytes).unwrap();
        assert_eq!(state.versions.len(), 2);
        assert!(state.versions.contains_key(&1));
        assert!(state.versions.contains_key(&3));
        assert_eq!(state.active_id, 3);
    }

    #[test]
    fn test_structurally_invalid_record_is_skipped() {
        let good = serde_json::to_value(aead_record(1)).unwrap();
        let bytes = serde_json::to_vec(&serde_json::json!({
            "active_id": 1,
            "keys": [good, {"id": 2, "type": "quantum"}, "garbage"],
        }))
        .unwrap();

        let state = decode_key_set("s", &bytes).unwrap();
        assert_eq!(state.versions.len(), 1);
    }

    #[test]
    fn test_corrupt_key_set_does_not_affect_siblings() {
        let mut object = StoredObject::new("ns", "keys");
        let good = KeySetRecord {
            active_id: 1,
            keys: vec![aead_record(1)],
        };
        object
            .data
            .insert(field_name("good"), serde_json::to_vec(&good).unwrap());
        object.data.insert(field_name("bad"), b"{not json".to_vec());
        object.data.insert("unrelated".to_string(), b"x".to_vec());

        let decoded = decode_object(&object);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["good"].active_id, 1);
    }

    fn add(existing: Option<&[u8]>, key_type: KeyType, force: bool) -> KeyResult<KeySetChange> {
        plan_key_version("s", existing, key_type, force)
    }

    fn pending(change: KeySetChange) -> PendingVersion {
        match change {
            KeySetChange::NeedsVersion(pending) => pending,
            KeySetChange::Unchanged(id) => panic!("expected a new version, active is {}", id),
        }
    }

    #[test]
    fn test_add_key_version_to_empty_set() {
        let pending = pending(add(None, KeyType::SymmetricAead, false).unwrap());
        assert_eq!(pending.id(), 1);
        let bytes = pending.finish(&aead_record(0)).unwrap();

        let state = decode_key_set("s", &bytes).unwrap();
        assert_eq!(state.active_id, 1);
        assert_eq!(state.versions.len(), 1);
    }

    #[test]
    fn test_ensure_keeps_active_key() {
        let existing = serde_json::to_vec(&KeySetRecord {
            active_id: 1,
            keys: vec![aead_record(1)],
        })
        .unwrap();

        let change = add(Some(&existing), KeyType::SymmetricAead, false).unwrap();
        assert!(matches!(change, KeySetChange::Unchanged(1)));
    }

    #[test]
    fn test_rotation_uses_max_id_and_keeps_corrupt_records() {
        let mut corrupt = aead_record(5);
        corrupt.secret.truncate(3);
        let existing = serde_json::to_vec(&KeySetRecord {
            active_id: 1,
            keys: vec![aead_record(1), corrupt],
        })
        .unwrap();

        let pending = pending(add(Some(&existing), KeyType::SymmetricAead, true).unwrap());
        assert_eq!(pending.id(), 6);
        let bytes = pending.finish(&aead_record(0)).unwrap();

        let raw: RawKeySetRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw.active_id, 6);
        assert_eq!(raw.keys.len(), 3);
        let ids: Vec<i64> = raw.keys.iter().map(|v| v["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 5, 6]);
    }

    #[test]
    fn test_out_of_range_id_is_ignored() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "active_id": 1,
            "keys": [
                serde_json::to_value(aead_record(1)).unwrap(),
                {"id": 4_294_967_298_i64, "type": "symmetric_aead"},
                {"id": -7},
            ],
        }))
        .unwrap();

        let pending = pending(add(Some(&bytes), KeyType::SymmetricAead, true).unwrap());
        assert_eq!(pending.id(), 2);
    }

    #[test]
    fn test_rotation_rejects_type_change() {
        let existing = serde_json::to_vec(&KeySetRecord {
            active_id: 1,
            keys: vec![aead_record(1)],
        })
        .unwrap();

        let err = add(Some(&existing), KeyType::AsymmetricSigning, true).unwrap_err();
        assert!(matches!(err, KeyError::WrongKeyType { .. }));
    }

    #[test]
    fn test_material_must_match_planned_type() {
        let pending = pending(add(None, KeyType::AsymmetricSigning, false).unwrap());
        let err = pending.finish(&aead_record(0)).unwrap_err();
        assert!(matches!(
            err,
            KeyError::WrongKeyType {
                expected: KeyType::AsymmetricSigning,
                actual: KeyType::SymmetricAead,
            }
        ));
    }

    #[test]
    fn test_uninitialized_set_gets_first_key() {
        let existing = serde_json::to_vec(&KeySetRecord {
            active_id: 0,
            keys: vec![aead_record(1), aead_record(2)],
        })
        .unwrap();

        let pending = pending(add(Some(&existing), KeyType::SymmetricAead, false).unwrap());
        assert_eq!(pending.id(), 3);
    }
}
