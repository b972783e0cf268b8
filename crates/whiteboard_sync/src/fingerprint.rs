//! Content fingerprints used to skip redundant writes.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::record::Snapshot;

/// SHA-256 over a canonical encoding of a snapshot.
///
/// Object keys are hashed in sorted order at every depth, so two snapshots
/// with the same content always produce the same fingerprint regardless of
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(snapshot: &Snapshot) -> Self {
        let mut hasher = Sha256::new();
        match serde_json::to_value(snapshot) {
            Ok(value) => hash_value(&mut hasher, &value),
            // Snapshot serialization cannot fail (string keys, JSON values).
            Err(_) => hasher.update(b"!"),
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(true) => hasher.update(b"t"),
        Value::Bool(false) => hasher.update(b"f"),
        Value::Number(number) => {
            hasher.update(b"#");
            hash_str(hasher, &number.to_string());
        }
        Value::String(text) => {
            hasher.update(b"s");
            hash_str(hasher, text);
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update((items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            hasher.update(b"{");
            hasher.update((entries.len() as u64).to_le_bytes());
            for (key, item) in entries {
                hash_str(hasher, key);
                hash_value(hasher, item);
            }
        }
    }
}

fn hash_str(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordMap, TypeName};
    use serde_json::json;

    fn snapshot_with(records: Vec<Record>) -> Snapshot {
        let mut map = RecordMap::new();
        for record in records {
            map.insert(record.id.clone(), record);
        }
        Snapshot::from_records(map)
    }

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let a = Record::new("shape:1", TypeName::Shape)
            .with_field("x", json!(1))
            .with_field("props", json!({ "w": 1, "h": 2 }));
        let b = Record::new("shape:1", TypeName::Shape)
            .with_field("props", json!({ "h": 2, "w": 1 }))
            .with_field("x", json!(1));

        assert_eq!(
            Fingerprint::of(&snapshot_with(vec![a])),
            Fingerprint::of(&snapshot_with(vec![b]))
        );
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let before = snapshot_with(vec![Record::new("shape:1", TypeName::Shape)
            .with_field("x", json!(1))]);
        let after = snapshot_with(vec![Record::new("shape:1", TypeName::Shape)
            .with_field("x", json!(2))]);

        assert_ne!(Fingerprint::of(&before), Fingerprint::of(&after));
        assert_eq!(Fingerprint::of(&before).to_hex().len(), 64);
    }

    #[test]
    fn test_string_boundaries_are_unambiguous() {
        let a = snapshot_with(vec![
            Record::new("page:1", TypeName::Page).with_field("name", json!(["ab", "c"]))
        ]);
        let b = snapshot_with(vec![
            Record::new("page:1", TypeName::Page).with_field("name", json!(["a", "bc"]))
        ]);

        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }
}
