//! Blob store wrappers for tests.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::storage::{BlobObject, BlobStore, InMemoryBlobStore};

/// In-memory store that records every `put` key and can be told to fail
/// or to stall writes.
#[derive(Default)]
pub struct CountingBlobStore {
    pub inner: InMemoryBlobStore,
    puts: Mutex<Vec<String>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    hold_puts: AtomicBool,
    held: AtomicBool,
    released: Notify,
}

impl CountingBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes to keys starting with `prefix`.
    pub fn puts_to(&self, prefix: &str) -> usize {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|key| key.starts_with(prefix))
            .count()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// While set, every `put` waits until it is cleared.
    pub fn set_hold_puts(&self, hold: bool) {
        self.hold_puts.store(hold, Ordering::SeqCst);
        if !hold {
            self.released.notify_waiters();
        }
    }

    /// Whether a `put` has waited on the hold.
    pub fn has_held_put(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), String> {
        loop {
            let released = self.released.notified();
            if !self.hold_puts.load(Ordering::SeqCst) {
                break;
            }
            self.held.store(true, Ordering::SeqCst);
            released.await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(format!("put to {} refused", key));
        }
        self.puts.lock().unwrap().push(key.to_string());
        self.inner.put(key, bytes, mime_type).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(format!("get of {} refused", key));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, String> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, String> {
        self.inner.list(prefix).await
    }

    async fn get_object(&self, key: &str) -> Result<Option<BlobObject>, String> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(format!("get of {} refused", key));
        }
        self.inner.get_object(key).await
    }
}
