//! # Whiteboard Sync
//!
//! Per-room synchronization and persistence for collaborative whiteboards.
//!
//! This crate provides:
//! - **Records**: the room document model ([`Record`], [`Snapshot`])
//! - **Merge**: loss-free right-biased union of partial client payloads
//! - **Migration**: conversion of every historical storage format into the
//!   canonical snapshot, with field backfill
//! - **Persistence**: throttled, fingerprint-gated writes that reconcile with
//!   storage, plus daily versioned backups
//! - **Room actors**: one single-writer task per room, addressed through a
//!   [`RoomRegistry`]
//!
//! Transport is left to the caller: a connection is an unbounded channel of
//! [`OutboundFrame`]s plus [`InboundMessage`]s fed into the room.

pub mod backup;
pub mod connections;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod migrate;
pub mod persistence;
pub mod protocol;
pub mod record;
pub mod registry;
pub mod room;
pub mod storage;

#[cfg(test)]
mod testing;

pub use backup::{BackupOutcome, BackupVersion};
pub use connections::{ConnectionId, ConnectionSink, OutboundFrame};
pub use document::MergeOutcome;
pub use error::{Result, RoomError};
pub use migrate::{Migration, MigrationStats, SourceFormat, extract_partial, migrate};
pub use persistence::FlushOutcome;
pub use protocol::InboundMessage;
pub use record::{Record, RecordMap, Snapshot, TypeName};
pub use registry::{RegistryStats, RoomRegistry, actor_key, validate_room_id};
pub use room::{RestoreSummary, RoomHandle, RoomSettings, RoomStats};
pub use storage::{BlobObject, BlobStore, InMemoryBlobStore, keys};
