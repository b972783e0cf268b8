//! Throttled, fingerprint-gated persistence of a room's document.
//!
//! Changes mark the room dirty and arm a deadline one interval out; bursts
//! of changes inside that window coalesce into one write. A write is skipped
//! entirely when the document fingerprint matches the last one written.
//!
//! Before writing, the stored document is re-read and unioned in: records
//! that exist only in storage are kept, in-memory records win on conflicts.
//! This keeps a fresh actor that has not yet seen every record from
//! clobbering what an earlier actor stored.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::document::{StoredDocument, fetch_stored};
use crate::error::{Result, RoomError};
use crate::fingerprint::Fingerprint;
use crate::record::Snapshot;
use crate::storage::{BlobStore, JSON_MIME, keys};

/// Default coalescing window for edits.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Union with the stored document before writing.
    Reconcile,
    /// Write the given document as is. Used by restores.
    Overwrite,
}

/// Whether a scheduled persist should run right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Immediate,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Content matched the last write.
    Unchanged,
    Written {
        fingerprint: Fingerprint,
        records: usize,
        /// Records pulled in from storage during reconciliation.
        reconciled: usize,
    },
}

/// Per-room persistence state.
#[derive(Debug)]
pub struct Persister {
    interval: Duration,
    last_fingerprint: Option<Fingerprint>,
    deadline: Option<Instant>,
    writes: u64,
}

impl Persister {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fingerprint: None,
            deadline: None,
            writes: 0,
        }
    }

    /// Record that `snapshot` is what storage already holds.
    pub fn mark_persisted(&mut self, snapshot: &Snapshot) {
        self.last_fingerprint = Some(Fingerprint::of(snapshot));
    }

    /// Note a change. The first change of a room that was never written
    /// is persisted immediately; later changes wait for the deadline.
    pub fn schedule(&mut self) -> Urgency {
        if self.last_fingerprint.is_none() {
            return Urgency::Immediate;
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.interval);
        }
        Urgency::Deferred
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a write is pending.
    pub fn is_dirty(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn last_fingerprint(&self) -> Option<Fingerprint> {
        self.last_fingerprint
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Write `doc` now if its content changed since the last write,
    /// reconciling with storage first.
    ///
    /// On failure the room stays dirty and a retry is armed one interval out.
    pub async fn flush(
        &mut self,
        store: &dyn BlobStore,
        room_id: &str,
        doc: &mut Snapshot,
    ) -> Result<FlushOutcome> {
        self.deadline = None;
        let result = self.write(store, room_id, doc, PersistMode::Reconcile).await;
        if result.is_err() {
            self.retry_later();
        }
        result
    }

    /// Write `doc` over storage as is, whatever storage holds.
    ///
    /// On success any pending write is settled, since `doc` supersedes it.
    /// On failure nothing changes: no retry is armed and a pending deadline
    /// is kept.
    pub async fn overwrite(
        &mut self,
        store: &dyn BlobStore,
        room_id: &str,
        doc: &mut Snapshot,
    ) -> Result<FlushOutcome> {
        let outcome = self
            .write(store, room_id, doc, PersistMode::Overwrite)
            .await?;
        self.deadline = None;
        Ok(outcome)
    }

    async fn write(
        &mut self,
        store: &dyn BlobStore,
        room_id: &str,
        doc: &mut Snapshot,
        mode: PersistMode,
    ) -> Result<FlushOutcome> {
        let fingerprint = Fingerprint::of(doc);
        if mode == PersistMode::Reconcile && self.last_fingerprint == Some(fingerprint) {
            debug!(room_id = %room_id, fingerprint = %fingerprint, "Document unchanged, skipping write");
            return Ok(FlushOutcome::Unchanged);
        }

        let reconciled = match mode {
            PersistMode::Reconcile => self.reconcile(store, room_id, doc).await?,
            PersistMode::Overwrite => 0,
        };

        let fingerprint = if reconciled > 0 {
            Fingerprint::of(doc)
        } else {
            fingerprint
        };

        let bytes = doc.to_json_bytes()?;
        store
            .put(&keys::room_document(room_id), &bytes, JSON_MIME)
            .await
            .map_err(RoomError::Storage)?;

        self.last_fingerprint = Some(fingerprint);
        self.writes += 1;
        info!(
            room_id = %room_id,
            records = doc.record_count(),
            reconciled,
            overwrite = mode == PersistMode::Overwrite,
            bytes = bytes.len(),
            fingerprint = %fingerprint,
            "Persisted room document"
        );

        Ok(FlushOutcome::Written {
            fingerprint,
            records: doc.record_count(),
            reconciled,
        })
    }

    /// Union stored-only records into `doc`. Returns how many were added.
    async fn reconcile(
        &self,
        store: &dyn BlobStore,
        room_id: &str,
        doc: &mut Snapshot,
    ) -> Result<usize> {
        let stored = match fetch_stored(store, room_id).await {
            Ok(StoredDocument::Found(migration)) => migration.snapshot,
            Ok(StoredDocument::Missing) => return Ok(0),
            Ok(StoredDocument::Corrupt(reason)) => {
                warn!(room_id = %room_id, error = %reason, "Stored document is not decodable, overwriting");
                return Ok(0);
            }
            Err(e) => {
                // Never write without knowing what storage holds.
                return Err(RoomError::Storage(e));
            }
        };

        let mut added = 0;
        for (id, record) in stored.records {
            if !doc.records.contains_key(&id) {
                doc.records.insert(id, record);
                added += 1;
            }
        }
        if added > 0 {
            debug!(room_id = %room_id, added, "Reconciled records from storage");
        }
        Ok(added)
    }

    fn retry_later(&mut self) {
        self.deadline = Some(Instant::now() + self.interval);
    }
}
