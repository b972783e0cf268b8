//! Canonical document store and merge engine.
//!
//! The store owns a room's authoritative [`Snapshot`]. Clients may hold only
//! part of the document, so a client payload is always treated as a partial
//! update: keys it carries overwrite, keys it omits are left alone. Nothing is
//! ever deleted by a merge. The only operation that can remove records is
//! [`DocumentStore::replace`], used by restore.

use std::collections::btree_map::Entry;
use tracing::{info, warn};

use crate::migrate::{self, Migration, MigrationStats};
use crate::record::{RecordMap, Snapshot};
use crate::storage::{BlobStore, keys};

/// What a merge did to the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergeOutcome {
    /// Whether the document content differs from before the merge.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.updated > 0
    }
}

impl Snapshot {
    /// Right-biased union: every record in `partial` is written, every record
    /// absent from `partial` is kept as is.
    pub fn merge(&mut self, partial: RecordMap) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for (id, mut record) in partial {
            if record.id != id {
                record.id = id.clone();
            }
            match self.records.entry(id) {
                Entry::Occupied(mut slot) => {
                    if *slot.get() == record {
                        outcome.unchanged += 1;
                    } else {
                        slot.insert(record);
                        outcome.updated += 1;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    outcome.inserted += 1;
                }
            }
        }
        outcome
    }
}

/// Where a cold-start load got its document from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// Decoded from storage; `rewrite` is set when the stored form was not
    /// canonical and should be written back immediately.
    Stored {
        stats: MigrationStats,
        rewrite: bool,
    },
    /// Nothing stored yet.
    Missing,
    /// Storage could not be read or decoded; started from an empty document.
    Fallback { reason: String },
}

/// Outcome of reading the stored document without any fallback applied.
pub(crate) enum StoredDocument {
    Missing,
    Corrupt(String),
    Found(Migration),
}

/// Read and migrate `rooms/{room_id}`. I/O errors propagate; payloads that
/// are not JSON are reported as [`StoredDocument::Corrupt`].
pub(crate) async fn fetch_stored(
    store: &dyn BlobStore,
    room_id: &str,
) -> Result<StoredDocument, String> {
    let Some(bytes) = store.get(&keys::room_document(room_id)).await? else {
        return Ok(StoredDocument::Missing);
    };
    match migrate::migrate_bytes(&bytes) {
        Ok(migration) => Ok(StoredDocument::Found(migration)),
        Err(e) => Ok(StoredDocument::Corrupt(e.to_string())),
    }
}

/// Lazily loaded, memoized holder of a room's canonical document.
#[derive(Debug, Default)]
pub struct DocumentStore {
    current: Option<Snapshot>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Snapshot> {
        self.current.as_mut()
    }

    /// Load the document on first use. Later calls return the cached
    /// document and no [`LoadSource`].
    ///
    /// Never fails: unreadable or undecodable storage yields an empty
    /// document, reported as [`LoadSource::Fallback`].
    pub async fn load(
        &mut self,
        store: &dyn BlobStore,
        room_id: &str,
    ) -> (&mut Snapshot, Option<LoadSource>) {
        let mut source = None;
        if self.current.is_none() {
            let (snapshot, loaded_from) = Self::read(store, room_id).await;
            self.current = Some(snapshot);
            source = Some(loaded_from);
        }
        (self.current.get_or_insert_with(Snapshot::empty), source)
    }

    /// Swap in a complete document. Records absent from `full` are gone.
    pub fn replace(&mut self, full: Snapshot) {
        self.current = Some(full);
    }

    /// Merge into the loaded document. Returns `None` if nothing is loaded.
    pub fn merge(&mut self, partial: RecordMap) -> Option<MergeOutcome> {
        self.current.as_mut().map(|snapshot| snapshot.merge(partial))
    }

    async fn read(store: &dyn BlobStore, room_id: &str) -> (Snapshot, LoadSource) {
        match fetch_stored(store, room_id).await {
            Ok(StoredDocument::Found(migration)) => {
                let rewrite = migration.needs_rewrite();
                if rewrite {
                    info!(
                        room_id = %room_id,
                        format = ?migration.format,
                        total = migration.stats.total,
                        migrated = migration.stats.migrated,
                        skipped = migration.stats.skipped,
                        errored = migration.stats.errored,
                        "Migrated stored document"
                    );
                }
                (
                    migration.snapshot,
                    LoadSource::Stored {
                        stats: migration.stats,
                        rewrite,
                    },
                )
            }
            Ok(StoredDocument::Missing) => (Snapshot::empty(), LoadSource::Missing),
            Ok(StoredDocument::Corrupt(reason)) => {
                warn!(room_id = %room_id, error = %reason, "Stored document is not decodable, starting empty");
                (Snapshot::empty(), LoadSource::Fallback { reason })
            }
            Err(reason) => {
                warn!(room_id = %room_id, error = %reason, "Failed to read stored document, starting empty");
                (Snapshot::empty(), LoadSource::Fallback { reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, TypeName};
    use crate::storage::{InMemoryBlobStore, JSON_MIME};
    use async_trait::async_trait;
    use serde_json::json;

    fn shape(id: &str, x: i64) -> Record {
        Record::new(id, TypeName::Shape)
            .with_field("type", json!("geo"))
            .with_field("x", json!(x))
    }

    fn partial(records: Vec<Record>) -> RecordMap {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    fn sample() -> Snapshot {
        Snapshot::from_records(partial(vec![
            shape("shape:a", 1),
            shape("shape:b", 2),
            Record::new("page:1", TypeName::Page),
        ]))
    }

    #[test]
    fn test_merge_never_shrinks() {
        let mut doc = sample();
        let before = doc.record_count();

        doc.merge(partial(vec![shape("shape:a", 10)]));
        assert!(doc.record_count() >= before);

        doc.merge(RecordMap::new());
        assert_eq!(doc.record_count(), before);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let update = partial(vec![shape("shape:a", 5), shape("shape:c", 3)]);

        let mut once = sample();
        let first = once.merge(update.clone());
        let mut twice = once.clone();
        let second = twice.merge(update);

        assert_eq!(once, twice);
        assert!(first.changed());
        assert!(!second.changed());
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn test_merge_preserves_untouched_keys() {
        let original = sample();
        let mut doc = original.clone();

        let outcome = doc.merge(partial(vec![shape("shape:a", 99)]));

        assert_eq!(outcome.updated, 1);
        assert_eq!(doc.get("shape:b"), original.get("shape:b"));
        assert_eq!(doc.get("page:1"), original.get("page:1"));
        assert_eq!(doc.get("shape:a").unwrap().fields["x"], json!(99));
    }

    #[test]
    fn test_clients_with_disjoint_views_both_land() {
        let mut doc = Snapshot::empty();

        // Client A knows only shape:1, client B never saw it.
        doc.merge(partial(vec![shape("shape:1", 1)]));
        doc.merge(partial(vec![shape("shape:2", 2)]));

        assert!(doc.get("shape:1").is_some());
        assert!(doc.get("shape:2").is_some());
    }

    #[test]
    fn test_merge_aligns_record_id_with_key() {
        let mut doc = Snapshot::empty();
        let mut update = RecordMap::new();
        update.insert("shape:key".to_string(), shape("shape:other", 1));

        doc.merge(update);
        assert_eq!(doc.get("shape:key").unwrap().id, "shape:key");
    }

    #[test]
    fn test_replace_drops_absent_records() {
        let mut store = DocumentStore::new();
        assert_eq!(store.merge(RecordMap::new()), None);
        store.replace(sample());
        assert!(store.merge(partial(vec![shape("shape:c", 1)])).unwrap().changed());
        store.replace(Snapshot::from_records(partial(vec![shape("shape:z", 0)])));

        let current = store.current().unwrap();
        assert_eq!(current.record_count(), 1);
        assert!(current.get("shape:a").is_none());
    }

    #[tokio::test]
    async fn test_load_is_memoized() {
        let blobs = InMemoryBlobStore::new();
        let mut store = DocumentStore::new();

        let (doc, source) = store.load(&blobs, "room").await;
        assert_eq!(source, Some(LoadSource::Missing));
        doc.merge(partial(vec![shape("shape:a", 1)]));

        // A later write to storage is not observed by the loaded document.
        blobs
            .put(&keys::room_document("room"), br#"{"records":{}}"#, JSON_MIME)
            .await
            .unwrap();
        let (doc, source) = store.load(&blobs, "room").await;
        assert_eq!(source, None);
        assert_eq!(doc.record_count(), 1);
    }

    #[tokio::test]
    async fn test_load_migrates_legacy_payload() {
        let blobs = InMemoryBlobStore::new();
        let legacy = json!([{ "state": { "id": "shape:a", "typeName": "shape", "type": "geo" } }]);
        blobs
            .put(
                &keys::room_document("room"),
                &serde_json::to_vec(&legacy).unwrap(),
                JSON_MIME,
            )
            .await
            .unwrap();

        let mut store = DocumentStore::new();
        let (doc, source) = store.load(&blobs, "room").await;
        assert_eq!(doc.record_count(), 1);
        assert!(matches!(source, Some(LoadSource::Stored { rewrite: true, .. })));
    }

    #[tokio::test]
    async fn test_load_falls_back_on_corrupt_payload() {
        let blobs = InMemoryBlobStore::new();
        blobs
            .put(&keys::room_document("room"), b"\xff\xfe", JSON_MIME)
            .await
            .unwrap();

        let mut store = DocumentStore::new();
        let (doc, source) = store.load(&blobs, "room").await;
        assert_eq!(*doc, Snapshot::empty());
        assert!(matches!(source, Some(LoadSource::Fallback { .. })));
    }

    struct UnreachableStore;

    #[async_trait]
    impl BlobStore for UnreachableStore {
        async fn put(&self, _: &str, _: &[u8], _: &str) -> Result<(), String> {
            Err("offline".into())
        }
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, String> {
            Err("offline".into())
        }
        async fn delete(&self, _: &str) -> Result<(), String> {
            Err("offline".into())
        }
        async fn exists(&self, _: &str) -> Result<bool, String> {
            Err("offline".into())
        }
        async fn list(&self, _: &str) -> Result<Vec<String>, String> {
            Err("offline".into())
        }
    }

    #[tokio::test]
    async fn test_load_falls_back_on_read_error() {
        let mut store = DocumentStore::new();
        let (doc, source) = store.load(&UnreachableStore, "room").await;
        assert_eq!(doc.record_count(), 0);
        assert_eq!(
            source,
            Some(LoadSource::Fallback {
                reason: "offline".to_string()
            })
        );
    }
}
