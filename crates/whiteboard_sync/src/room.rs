//! Room actor.
//!
//! Each room is owned by one [`RoomActor`] task. All state (the document,
//! the connections, the persistence timer) lives inside that task and is
//! touched only while handling one command at a time, so nothing here needs
//! a lock. Everything else talks to the room through a cloneable
//! [`RoomHandle`].
//!
//! The actor is addressed by an opaque actor key and does not know its room
//! id until a client connects. The id is then recorded under
//! `actors/{actorKey}/identity` so that a later actor for the same key can
//! serve reads before anyone reconnects.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::backup::{self, BackupOutcome};
use crate::connections::{ConnectionId, ConnectionRegistry, ConnectionSink, OutboundFrame};
use crate::document::{DocumentStore, LoadSource, MergeOutcome};
use crate::error::{Result, RoomError};
use crate::persistence::{DEFAULT_PERSIST_INTERVAL, FlushOutcome, Persister, Urgency};
use crate::protocol::{self, Frame, InboundAction, InboundMessage};
use crate::record::{RecordMap, Snapshot};
use crate::storage::{BlobStore, keys};

const COMMAND_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Coalescing window for persistence writes.
    pub persist_interval: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            persist_interval: DEFAULT_PERSIST_INTERVAL,
        }
    }
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub room_id: Option<String>,
    pub connections: usize,
    pub records: Option<usize>,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub date_key: String,
    pub records: usize,
    pub assets: usize,
}

pub enum RoomCommand {
    Connect {
        room_id: String,
        session_id: String,
        identity: Option<String>,
        sink: ConnectionSink,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    /// Drop the session if it is still registration `connection`.
    Disconnect {
        session_id: String,
        connection: ConnectionId,
    },
    Inbound {
        session_id: String,
        message: InboundMessage,
    },
    GetDocument {
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    MergeDocument {
        partial: RecordMap,
        reply: oneshot::Sender<Result<MergeOutcome>>,
    },
    CreateBackup {
        reply: oneshot::Sender<Result<BackupOutcome>>,
    },
    ListVersions {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Restore {
        date_key: String,
        reply: oneshot::Sender<Result<RestoreSummary>>,
    },
    Stats {
        reply: oneshot::Sender<RoomStats>,
    },
    Flush {
        reply: oneshot::Sender<Result<FlushOutcome>>,
    },
    /// Stop the actor if no connection is open and everything is written.
    ShutdownIfIdle {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable address of a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    actor_key: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn actor_key(&self) -> &str {
        &self.actor_key
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles address the same actor task.
    pub fn same_actor(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn send(&self, command: RoomCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| RoomError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    /// Register a session. The returned id is what [`RoomHandle::disconnect`]
    /// needs to remove exactly this registration.
    pub async fn connect(
        &self,
        room_id: &str,
        session_id: &str,
        identity: Option<String>,
        sink: ConnectionSink,
    ) -> Result<ConnectionId> {
        self.request(|reply| RoomCommand::Connect {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            identity,
            sink,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self, session_id: &str, connection: ConnectionId) -> Result<()> {
        self.send(RoomCommand::Disconnect {
            session_id: session_id.to_string(),
            connection,
        })
        .await
    }

    pub async fn inbound(&self, session_id: &str, message: InboundMessage) -> Result<()> {
        self.send(RoomCommand::Inbound {
            session_id: session_id.to_string(),
            message,
        })
        .await
    }

    pub async fn document(&self) -> Result<Snapshot> {
        self.request(|reply| RoomCommand::GetDocument { reply }).await?
    }

    pub async fn merge(&self, partial: RecordMap) -> Result<MergeOutcome> {
        self.request(|reply| RoomCommand::MergeDocument { partial, reply })
            .await?
    }

    pub async fn create_backup(&self) -> Result<BackupOutcome> {
        self.request(|reply| RoomCommand::CreateBackup { reply }).await?
    }

    pub async fn list_versions(&self) -> Result<Vec<String>> {
        self.request(|reply| RoomCommand::ListVersions { reply }).await?
    }

    pub async fn restore(&self, date_key: &str) -> Result<RestoreSummary> {
        self.request(|reply| RoomCommand::Restore {
            date_key: date_key.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<RoomStats> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.request(|reply| RoomCommand::Flush { reply }).await?
    }

    pub async fn shutdown_if_idle(&self) -> Result<bool> {
        self.request(|reply| RoomCommand::ShutdownIfIdle { reply })
            .await
    }
}

/// Single-writer owner of one room's state.
pub struct RoomActor {
    actor_key: String,
    store: Arc<dyn BlobStore>,
    room_id: Option<String>,
    identity_pending: bool,
    document: DocumentStore,
    connections: ConnectionRegistry,
    persister: Persister,
    last_backup_date: Option<String>,
}

impl RoomActor {
    /// Spawn the actor task and return its handle.
    pub fn spawn(
        actor_key: impl Into<String>,
        store: Arc<dyn BlobStore>,
        settings: RoomSettings,
    ) -> RoomHandle {
        let actor_key = actor_key.into();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Self {
            actor_key: actor_key.clone(),
            store,
            room_id: None,
            identity_pending: false,
            document: DocumentStore::new(),
            connections: ConnectionRegistry::new(),
            persister: Persister::new(settings.persist_interval),
            last_backup_date: None,
        };
        tokio::spawn(actor.run(rx));
        RoomHandle {
            actor_key: actor_key.into(),
            tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        self.read_identity().await;

        loop {
            let deadline = self.persister.deadline();
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await == Control::Stop {
                        info!(actor_key = %self.actor_key, room_id = ?self.room_id, "Room actor stopped");
                        return;
                    }
                }
                _ = wait_until(deadline) => {
                    self.persist().await;
                }
            }
        }

        // Every handle is gone; write whatever is pending.
        self.persist().await;
        debug!(actor_key = %self.actor_key, "Room actor channel closed");
    }

    async fn handle(&mut self, command: RoomCommand) -> Control {
        match command {
            RoomCommand::Connect {
                room_id,
                session_id,
                identity,
                sink,
                reply,
            } => {
                let result = self.connect(&room_id, &session_id, identity, sink).await;
                let _ = reply.send(result);
            }
            RoomCommand::Disconnect {
                session_id,
                connection,
            } => {
                if self.connections.unregister(&session_id, connection) {
                    info!(
                        room_id = ?self.room_id,
                        session_id = %session_id,
                        connections = self.connections.len(),
                        "Client disconnected"
                    );
                }
            }
            RoomCommand::Inbound {
                session_id,
                message,
            } => self.inbound(&session_id, message).await,
            RoomCommand::GetDocument { reply } => {
                let result = self.loaded().await.map(|doc| doc.clone());
                let _ = reply.send(result);
            }
            RoomCommand::MergeDocument { partial, reply } => {
                let result = self.merge_from_http(partial).await;
                let _ = reply.send(result);
            }
            RoomCommand::CreateBackup { reply } => {
                let result = self.create_backup().await;
                let _ = reply.send(result);
            }
            RoomCommand::ListVersions { reply } => {
                let result = match self.room_id() {
                    Ok(room_id) => backup::list_versions(self.store.as_ref(), &room_id).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            RoomCommand::Restore { date_key, reply } => {
                let result = self.restore(&date_key).await;
                let _ = reply.send(result);
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RoomCommand::Flush { reply } => {
                let result = self.flush().await;
                let _ = reply.send(result);
            }
            RoomCommand::ShutdownIfIdle { reply } => {
                if !self.connections.is_empty() {
                    let _ = reply.send(false);
                    return Control::Continue;
                }
                self.persist().await;
                let idle = !self.persister.is_dirty();
                let _ = reply.send(idle);
                if idle {
                    return Control::Stop;
                }
            }
        }
        Control::Continue
    }

    // ==================== Identity ====================

    async fn read_identity(&mut self) {
        match self.store.get(&keys::actor_identity(&self.actor_key)).await {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(room_id) if !room_id.is_empty() => {
                    debug!(actor_key = %self.actor_key, room_id = %room_id, "Restored room identity");
                    self.room_id = Some(room_id);
                }
                _ => warn!(actor_key = %self.actor_key, "Ignoring unreadable room identity"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(actor_key = %self.actor_key, error = %e, "Failed to read room identity");
            }
        }
    }

    /// Bind the actor to `room_id` on first contact.
    async fn claim_identity(&mut self, room_id: &str) -> Result<()> {
        match &self.room_id {
            Some(existing) if existing == room_id => {
                if self.identity_pending {
                    self.write_identity().await;
                }
                Ok(())
            }
            Some(existing) => Err(RoomError::InvalidRoomId(format!(
                "actor is bound to a different room ({})",
                existing
            ))),
            None => {
                self.room_id = Some(room_id.to_string());
                self.write_identity().await;
                Ok(())
            }
        }
    }

    async fn write_identity(&mut self) {
        let Some(room_id) = self.room_id.clone() else {
            return;
        };
        match self
            .store
            .put(
                &keys::actor_identity(&self.actor_key),
                room_id.as_bytes(),
                "text/plain",
            )
            .await
        {
            Ok(()) => {
                self.identity_pending = false;
                info!(actor_key = %self.actor_key, room_id = %room_id, "Recorded room identity");
            }
            Err(e) => {
                self.identity_pending = true;
                warn!(room_id = %room_id, error = %e, "Failed to record room identity, will retry");
            }
        }
    }

    fn room_id(&self) -> Result<String> {
        self.room_id.clone().ok_or(RoomError::NotInitialized)
    }

    // ==================== Document ====================

    /// The document, loading it on first use.
    async fn loaded(&mut self) -> Result<&mut Snapshot> {
        let room_id = self.room_id()?;
        let (doc, source) = self.document.load(self.store.as_ref(), &room_id).await;

        let mut rewrite = false;
        match source {
            Some(LoadSource::Stored { stats, rewrite: needs_rewrite }) => {
                info!(room_id = %room_id, records = doc.record_count(), total = stats.total, "Loaded room document");
                if needs_rewrite {
                    rewrite = true;
                } else {
                    self.persister.mark_persisted(doc);
                }
            }
            Some(LoadSource::Missing) => {
                info!(room_id = %room_id, "No stored document, starting empty");
            }
            Some(LoadSource::Fallback { .. }) | None => {}
        }

        if rewrite {
            // Converge storage to the canonical form right away. The write
            // reconciles, so whatever this load could not read survives.
            self.flush_logged().await;
        }

        self.document.current_mut().ok_or(RoomError::NotInitialized)
    }

    async fn schedule_persist(&mut self) {
        if self.persister.schedule() == Urgency::Immediate {
            self.flush_logged().await;
        }
    }

    async fn flush(&mut self) -> Result<FlushOutcome> {
        let room_id = self.room_id()?;
        let Some(doc) = self.document.current_mut() else {
            return Ok(FlushOutcome::Unchanged);
        };
        let outcome = self
            .persister
            .flush(self.store.as_ref(), &room_id, doc)
            .await?;

        if let FlushOutcome::Written { .. } = outcome {
            self.after_write(&room_id).await;
        }
        Ok(outcome)
    }

    async fn after_write(&mut self, room_id: &str) {
        if self.identity_pending {
            self.write_identity().await;
        }
        self.backup_after_write(room_id).await;
    }

    /// Flush if anything is pending.
    async fn persist(&mut self) {
        if self.persister.is_dirty() {
            self.flush_logged().await;
        }
    }

    /// Flush, logging instead of returning failures. The persister re-arms
    /// its deadline on failure.
    async fn flush_logged(&mut self) {
        if self.room_id.is_none() || !self.document.is_loaded() {
            return;
        }
        if let Err(e) = self.flush().await {
            error!(room_id = ?self.room_id, error = %e, "Failed to persist room document");
        }
    }

    async fn backup_after_write(&mut self, room_id: &str) {
        let today = backup::date_key(Utc::now());
        if self.last_backup_date.as_deref() == Some(today.as_str()) {
            return;
        }
        if let Err(e) = self.backup_current(room_id).await {
            warn!(room_id = %room_id, error = %e, "Daily backup failed");
        }
    }

    async fn create_backup(&mut self) -> Result<BackupOutcome> {
        let room_id = self.room_id()?;
        self.loaded().await?;
        self.backup_current(&room_id).await
    }

    /// Back up the already loaded document.
    async fn backup_current(&mut self, room_id: &str) -> Result<BackupOutcome> {
        let Some(doc) = self.document.current() else {
            return Err(RoomError::NotInitialized);
        };
        let outcome =
            backup::create_daily_backup_if_absent(self.store.as_ref(), room_id, doc, Utc::now())
                .await?;
        self.last_backup_date = Some(outcome.date_key().to_string());
        Ok(outcome)
    }

    async fn restore(&mut self, date_key: &str) -> Result<RestoreSummary> {
        let room_id = self.room_id()?;
        backup::validate_date_key(date_key)?;
        self.loaded().await?;

        let version = backup::load_version(self.store.as_ref(), &room_id, date_key).await?;
        let assets = backup::restore_assets(self.store.as_ref(), &room_id, &version).await?;
        let records = version.snapshot.record_count();

        // Storage first: a failed write leaves the live document in place.
        let mut restored = version.snapshot;
        self.persister
            .overwrite(self.store.as_ref(), &room_id, &mut restored)
            .await?;
        self.document.replace(restored);
        self.after_write(&room_id).await;

        info!(room_id = %room_id, date_key = %date_key, records, assets, "Restored room from backup");
        self.resend_snapshot_to_all(&room_id);

        Ok(RestoreSummary {
            date_key: date_key.to_string(),
            records,
            assets,
        })
    }

    // ==================== Connections ====================

    async fn connect(
        &mut self,
        room_id: &str,
        session_id: &str,
        identity: Option<String>,
        sink: ConnectionSink,
    ) -> Result<ConnectionId> {
        self.claim_identity(room_id).await?;
        self.loaded().await?;

        let connection = self.connections.register(session_id, sink, identity);
        info!(
            room_id = %room_id,
            session_id = %session_id,
            user = ?self.connections.identity(session_id),
            connections = self.connections.len(),
            "Client connected"
        );

        self.send_snapshot(room_id, session_id)?;
        Ok(connection)
    }

    fn send_snapshot(&self, room_id: &str, session_id: &str) -> Result<()> {
        let Some(doc) = self.document.current() else {
            return Err(RoomError::NotInitialized);
        };
        let frame = Frame::snapshot(room_id, session_id, doc)?.encode()?;
        if !self.connections.send_to(session_id, frame) {
            debug!(session_id = %session_id, "Initial sync frame not delivered");
        }
        Ok(())
    }

    fn resend_snapshot_to_all(&self, room_id: &str) {
        let Some(doc) = self.document.current() else {
            return;
        };
        for session_id in self.connections.session_ids() {
            match Frame::snapshot(room_id, session_id, doc).and_then(|frame| frame.encode()) {
                Ok(frame) => {
                    self.connections.send_to(session_id, frame);
                }
                Err(e) => warn!(error = %e, "Failed to encode snapshot frame"),
            }
        }
    }

    async fn inbound(&mut self, session_id: &str, message: InboundMessage) {
        if !self.connections.contains(session_id) {
            debug!(session_id = %session_id, "Dropping frame from unregistered session");
            return;
        }
        let Ok(room_id) = self.room_id() else {
            return;
        };

        let action = match protocol::interpret(&room_id, session_id, message) {
            Ok(action) => action,
            Err(e) => {
                warn!(room_id = ?self.room_id, session_id = %session_id, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match action {
            InboundAction::Sync {
                partial,
                target_id,
                relay,
            } => {
                let outcome = match self.loaded().await {
                    Ok(doc) => doc.merge(partial),
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Dropping sync frame");
                        return;
                    }
                };
                debug!(
                    session_id = %session_id,
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    "Merged sync frame"
                );
                if outcome.changed() {
                    self.schedule_persist().await;
                }
                self.relay(session_id, target_id.as_deref(), relay);
            }
            InboundAction::Relay(frame) => {
                self.connections.broadcast_except(session_id, &frame);
            }
            InboundAction::Pong => match Frame::Pong.encode() {
                Ok(frame) => {
                    self.connections.send_to(session_id, frame);
                }
                Err(e) => warn!(error = %e, "Failed to encode pong"),
            },
            InboundAction::SendSnapshot => {
                if let Err(e) = self.send_snapshot(&room_id, session_id) {
                    warn!(session_id = %session_id, error = %e, "Failed to resend document");
                }
            }
            InboundAction::Ignore => {}
        }
    }

    fn relay(&self, sender_id: &str, target_id: Option<&str>, frame: OutboundFrame) {
        match target_id {
            Some(target_id) => {
                if !self.connections.send_to(target_id, frame) {
                    debug!(target_id = %target_id, "Sync frame target not connected");
                }
            }
            None => {
                self.connections.broadcast_except(sender_id, &frame);
            }
        }
    }

    async fn merge_from_http(&mut self, partial: RecordMap) -> Result<MergeOutcome> {
        let room_id = self.room_id()?;
        let frame = Frame::http_merge(&room_id, &partial)?.encode()?;

        let outcome = self.loaded().await?.merge(partial);
        if outcome.changed() {
            self.schedule_persist().await;
        }
        self.connections
            .broadcast_except(protocol::HTTP_SENDER_ID, &frame);

        info!(
            room_id = %room_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "Merged document over HTTP"
        );
        Ok(outcome)
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.room_id.clone(),
            connections: self.connections.len(),
            records: self.document.current().map(Snapshot::record_count),
            dirty: self.persister.is_dirty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Stop,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
