//! Blob storage seam.
//!
//! Rooms persist through a [`BlobStore`]: an object store addressed by string
//! keys. The server crate provides an S3/R2-backed implementation; tests and
//! local runs use [`InMemoryBlobStore`].
//!
//! Key layout (see [`keys`]):
//!
//! ```text
//! rooms/{roomId}                  canonical snapshot
//! backups/{roomId}/{dateKey}      dated snapshot plus serialized assets
//! uploads/{roomId}/{name}         binary assets
//! actors/{actorKey}/identity      room id recorded by the owning actor
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const JSON_MIME: &str = "application/json";
pub const OCTET_STREAM_MIME: &str = "application/octet-stream";

/// A stored object with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;

    async fn delete(&self, key: &str) -> Result<(), String>;

    async fn exists(&self, key: &str) -> Result<bool, String>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, String>;

    /// Like [`BlobStore::get`] but also returns the stored content type.
    async fn get_object(&self, key: &str) -> Result<Option<BlobObject>, String> {
        Ok(self.get(key).await?.map(|bytes| BlobObject {
            bytes,
            mime_type: OCTET_STREAM_MIME.to_string(),
        }))
    }
}

pub mod keys {
    pub fn room_document(room_id: &str) -> String {
        format!("rooms/{}", room_id)
    }

    pub fn backups_prefix(room_id: &str) -> String {
        format!("backups/{}/", room_id)
    }

    pub fn backup(room_id: &str, date_key: &str) -> String {
        format!("{}{}", backups_prefix(room_id), date_key)
    }

    pub fn uploads_prefix(room_id: &str) -> String {
        format!("uploads/{}/", room_id)
    }

    pub fn upload(room_id: &str, name: &str) -> String {
        format!("{}{}", uploads_prefix(room_id), name)
    }

    pub fn actor_identity(actor_key: &str) -> String {
        format!("actors/{}/identity", actor_key)
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<BTreeMap<String, BlobObject>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String> {
        self.blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .insert(
                key.to_string(),
                BlobObject {
                    bytes: bytes.to_vec(),
                    mime_type: mime_type.to_string(),
                },
            );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .get(key)
            .map(|object| object.bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, String> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, String> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<Option<BlobObject>, String> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| "Failed to lock in-memory blob store".to_string())?
            .get(key)
            .cloned())
    }
}
