//! Keyed registry of live room actors.
//!
//! Routes a room id to the single actor that owns it, spawning actors on
//! first contact and evicting them once they are idle.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connections::{ConnectionId, ConnectionSink};
use crate::error::{Result, RoomError};
use crate::room::{RoomActor, RoomHandle, RoomSettings};
use crate::storage::BlobStore;

const MAX_ROOM_ID_LEN: usize = 128;

/// Aggregate statistics across all live rooms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_connections: usize,
}

/// Stable actor key for a room id.
pub fn actor_key(room_id: &str) -> String {
    let digest = Sha256::digest(room_id.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Room ids are 1 to 128 characters of `[A-Za-z0-9._:-]`.
pub fn validate_room_id(room_id: &str) -> Result<()> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RoomError::InvalidRoomId(room_id.to_string()))
    }
}

/// All live rooms of this process, keyed by actor key.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    store: Arc<dyn BlobStore>,
    settings: RoomSettings,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn BlobStore>, settings: RoomSettings) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Get the room's actor, spawning one if none is running.
    pub async fn get_or_spawn(&self, room_id: &str) -> Result<RoomHandle> {
        validate_room_id(room_id)?;
        let key = actor_key(room_id);

        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(&key)
                && !handle.is_closed()
            {
                return Ok(handle.clone());
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(handle) = rooms.get(&key)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }

        let handle = RoomActor::spawn(key.clone(), self.store.clone(), self.settings.clone());
        rooms.insert(key, handle.clone());
        info!(room_id = %room_id, actor_key = %handle.actor_key(), "Spawned room actor");

        Ok(handle)
    }

    /// Get the room's actor without spawning one.
    pub async fn get(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&actor_key(room_id))
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Connect a session, retrying once if the actor stopped in between.
    pub async fn connect(
        &self,
        room_id: &str,
        session_id: &str,
        identity: Option<String>,
        sink: ConnectionSink,
    ) -> Result<(RoomHandle, ConnectionId)> {
        let handle = self.get_or_spawn(room_id).await?;
        match handle
            .connect(room_id, session_id, identity.clone(), sink.clone())
            .await
        {
            Err(RoomError::Closed) => {
                debug!(room_id = %room_id, "Room actor stopped during connect, retrying");
                let handle = self.get_or_spawn(room_id).await?;
                let connection = handle.connect(room_id, session_id, identity, sink).await?;
                Ok((handle, connection))
            }
            Err(e) => Err(e),
            Ok(connection) => Ok((handle, connection)),
        }
    }

    /// Stop the room's actor if it has no connections.
    pub async fn maybe_remove_room(&self, room_id: &str) -> bool {
        self.remove_if_idle(&actor_key(room_id)).await
    }

    async fn remove_if_idle(&self, key: &str) -> bool {
        let Some(handle) = self.rooms.read().await.get(key).cloned() else {
            return false;
        };
        self.stop_and_remove(key, &handle).await
    }

    /// Ask `handle` to stop, holding no registry lock while the actor writes
    /// what is pending. The entry is removed only if it still is that actor.
    async fn stop_and_remove(&self, key: &str, handle: &RoomHandle) -> bool {
        let stopped = match handle.shutdown_if_idle().await {
            Ok(idle) => idle,
            Err(RoomError::Closed) => true,
            Err(e) => {
                warn!(actor_key = %key, error = %e, "Failed to stop idle room");
                false
            }
        };
        if !stopped {
            return false;
        }

        let mut rooms = self.rooms.write().await;
        if rooms
            .get(key)
            .is_some_and(|current| current.same_actor(handle))
        {
            rooms.remove(key);
            info!(actor_key = %key, "Removed idle room");
        }
        true
    }

    /// Evict every idle room. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut removed = 0;
        for key in self.keys().await {
            if self.remove_if_idle(&key).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for handle in self.handles().await {
            if let Ok(room) = handle.stats().await {
                stats.active_rooms += 1;
                stats.active_connections += room.connections;
            }
        }
        stats
    }

    /// Ask every initialized room for its daily backup. Returns how many
    /// backups were newly created.
    pub async fn backup_all(&self) -> usize {
        let mut created = 0;
        for handle in self.handles().await {
            match handle.create_backup().await {
                Ok(crate::backup::BackupOutcome::Created { .. }) => created += 1,
                Ok(_) | Err(RoomError::NotInitialized) | Err(RoomError::Closed) => {}
                Err(e) => {
                    warn!(actor_key = %handle.actor_key(), error = %e, "Backup sweep failed for room")
                }
            }
        }
        created
    }

    /// Flush every room. Used on shutdown.
    pub async fn flush_all(&self) {
        for handle in self.handles().await {
            match handle.flush().await {
                Ok(_) | Err(RoomError::NotInitialized) | Err(RoomError::Closed) => {}
                Err(e) => {
                    warn!(actor_key = %handle.actor_key(), error = %e, "Failed to flush room")
                }
            }
        }
    }

    async fn keys(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn handles(&self) -> Vec<RoomHandle> {
        self.rooms.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RecordMap, TypeName};
    use crate::storage::{InMemoryBlobStore, keys};
    use crate::testing::CountingBlobStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(InMemoryBlobStore::new()), RoomSettings::default())
    }

    #[test]
    fn test_room_id_validation() {
        assert!(validate_room_id("room-1").is_ok());
        assert!(validate_room_id("team.board:42_a").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("a/b").is_err());
        assert!(validate_room_id("room id").is_err());
        assert!(validate_room_id(&"x".repeat(129)).is_err());
        assert!(validate_room_id(&"x".repeat(128)).is_ok());
    }

    #[test]
    fn test_actor_key_is_stable() {
        assert_eq!(actor_key("room-1"), actor_key("room-1"));
        assert_ne!(actor_key("room-1"), actor_key("room-2"));
        assert_eq!(actor_key("room-1").len(), 32);
    }

    #[tokio::test]
    async fn test_get_or_spawn_reuses_actor() {
        let registry = registry();
        let first = registry.get_or_spawn("room-1").await.unwrap();
        let second = registry.get_or_spawn("room-1").await.unwrap();
        assert_eq!(first.actor_key(), second.actor_key());
        assert!(registry.get_or_spawn("bad/id").await.is_err());
    }

    #[tokio::test]
    async fn test_idle_rooms_are_removed_and_respawned() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, connection) = registry.connect("room-1", "s1", None, tx).await.unwrap();

        assert_eq!(
            registry.stats().await,
            RegistryStats {
                active_rooms: 1,
                active_connections: 1
            }
        );
        assert!(!registry.maybe_remove_room("room-1").await);

        handle.disconnect("s1", connection).await.unwrap();
        assert!(registry.maybe_remove_room("room-1").await);
        assert!(registry.get("room-1").await.is_none());

        // A fresh actor picks the room back up from storage.
        let respawned = registry.get_or_spawn("room-1").await.unwrap();
        assert!(respawned.document().await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_and_backup_all() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, connection) = registry.connect("room-1", "s1", None, tx).await.unwrap();
        registry.get_or_spawn("never-connected").await.unwrap();

        // The room that was never connected has no id and is skipped.
        assert_eq!(registry.backup_all().await, 1);
        assert_eq!(registry.backup_all().await, 0);
        assert_eq!(
            registry.store().list("backups/room-1/").await.unwrap().len(),
            1
        );

        assert_eq!(registry.sweep_idle().await, 1);
        handle.disconnect("s1", connection).await.unwrap();
        assert_eq!(registry.sweep_idle().await, 1);
        assert_eq!(registry.stats().await, RegistryStats::default());
    }

    #[tokio::test]
    async fn test_eviction_does_not_block_other_rooms() {
        let store = Arc::new(CountingBlobStore::new());
        let registry = Arc::new(RoomRegistry::new(store.clone(), RoomSettings::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, connection) = registry.connect("room-1", "s1", None, tx).await.unwrap();

        let shape = |id: &str| -> RecordMap {
            let record = Record::new(id, TypeName::Shape);
            [(record.id.clone(), record)].into_iter().collect()
        };
        // The first change is written right away, the second waits.
        handle.merge(shape("shape:a")).await.unwrap();
        handle.merge(shape("shape:b")).await.unwrap();
        handle.disconnect("s1", connection).await.unwrap();

        // Stall the write the idle actor does before stopping.
        store.set_hold_puts(true);
        let evicting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.maybe_remove_room("room-1").await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.has_held_put() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("eviction reached storage");

        let other = tokio::time::timeout(Duration::from_secs(1), registry.get_or_spawn("room-2"))
            .await
            .expect("registry stayed available during eviction");
        assert!(other.is_ok());

        store.set_hold_puts(false);
        assert!(evicting.await.unwrap());
        assert!(registry.get("room-1").await.is_none());
        let stored = store.get(&keys::room_document("room-1")).await.unwrap().unwrap();
        assert!(String::from_utf8(stored).unwrap().contains("shape:b"));
    }

    #[tokio::test]
    async fn test_eviction_spares_a_replacement_actor() {
        let registry = registry();
        let stale = registry.get_or_spawn("room-1").await.unwrap();
        assert!(stale.shutdown_if_idle().await.unwrap());
        tokio::task::yield_now().await;

        let fresh = registry.get_or_spawn("room-1").await.unwrap();
        assert!(!fresh.same_actor(&stale));

        // An eviction that started with the old actor finishes late.
        assert!(registry.stop_and_remove(&actor_key("room-1"), &stale).await);
        let current = registry.get("room-1").await.expect("replacement kept");
        assert!(current.same_actor(&fresh));
        assert!(current.stats().await.is_ok());
    }
}
