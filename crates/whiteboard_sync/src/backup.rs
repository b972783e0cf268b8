//! Daily versioned backups.
//!
//! One backup per room per UTC calendar day lives at
//! `backups/{roomId}/{YYYY-MM-DD}`. It carries the full document and a copy of
//! every asset under `uploads/{roomId}/`, so a restore brings both back.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::{Result, RoomError};
use crate::record::Snapshot;
use crate::storage::{BlobStore, JSON_MIME, keys};

const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

/// A dated, restorable copy of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupVersion {
    pub timestamp: DateTime<Utc>,
    pub date_key: String,
    pub snapshot: Snapshot,
    /// Asset name (relative to the room's upload prefix) to content.
    #[serde(default)]
    pub assets: BTreeMap<String, BackupAsset>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupAsset {
    pub mime_type: String,
    /// Base64 of the asset bytes.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Created { date_key: String, assets: usize },
    AlreadyExists { date_key: String },
}

impl BackupOutcome {
    pub fn date_key(&self) -> &str {
        match self {
            BackupOutcome::Created { date_key, .. } | BackupOutcome::AlreadyExists { date_key } => {
                date_key
            }
        }
    }
}

/// Calendar day key for `now`.
pub fn date_key(now: DateTime<Utc>) -> String {
    now.format(DATE_KEY_FORMAT).to_string()
}

/// Accept only real dates in zero-padded `YYYY-MM-DD` form.
pub fn validate_date_key(date_key: &str) -> Result<()> {
    let parsed = NaiveDate::parse_from_str(date_key, DATE_KEY_FORMAT)
        .map_err(|_| RoomError::InvalidDateKey(date_key.to_string()))?;
    if parsed.format(DATE_KEY_FORMAT).to_string() != date_key {
        return Err(RoomError::InvalidDateKey(date_key.to_string()));
    }
    Ok(())
}

/// Write today's backup unless one already exists.
pub async fn create_daily_backup_if_absent(
    store: &dyn BlobStore,
    room_id: &str,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
) -> Result<BackupOutcome> {
    let date_key = date_key(now);
    let key = keys::backup(room_id, &date_key);

    if store.exists(&key).await.map_err(RoomError::Storage)? {
        return Ok(BackupOutcome::AlreadyExists { date_key });
    }

    let assets = collect_assets(store, room_id).await?;
    let asset_count = assets.len();
    let version = BackupVersion {
        timestamp: now,
        date_key: date_key.clone(),
        snapshot: snapshot.clone(),
        assets,
    };

    let bytes = serde_json::to_vec(&version)?;
    store
        .put(&key, &bytes, JSON_MIME)
        .await
        .map_err(RoomError::Storage)?;

    info!(
        room_id = %room_id,
        date_key = %date_key,
        records = snapshot.record_count(),
        assets = asset_count,
        "Created daily backup"
    );
    Ok(BackupOutcome::Created {
        date_key,
        assets: asset_count,
    })
}

async fn collect_assets(
    store: &dyn BlobStore,
    room_id: &str,
) -> Result<BTreeMap<String, BackupAsset>> {
    let prefix = keys::uploads_prefix(room_id);
    let mut assets = BTreeMap::new();

    for key in store.list(&prefix).await.map_err(RoomError::Storage)? {
        let Some(name) = key.strip_prefix(&prefix) else {
            continue;
        };
        match store.get_object(&key).await.map_err(RoomError::Storage)? {
            Some(object) => {
                assets.insert(
                    name.to_string(),
                    BackupAsset {
                        mime_type: object.mime_type,
                        data: BASE64.encode(&object.bytes),
                    },
                );
            }
            // Deleted between list and get.
            None => continue,
        }
    }

    Ok(assets)
}

/// Date keys of every stored backup, oldest first.
pub async fn list_versions(store: &dyn BlobStore, room_id: &str) -> Result<Vec<String>> {
    let prefix = keys::backups_prefix(room_id);
    let mut versions: Vec<String> = store
        .list(&prefix)
        .await
        .map_err(RoomError::Storage)?
        .into_iter()
        .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
        .filter(|date_key| validate_date_key(date_key).is_ok())
        .collect();
    versions.sort();
    Ok(versions)
}

/// Read one backup. Absent backups are [`RoomError::VersionNotFound`].
pub async fn load_version(
    store: &dyn BlobStore,
    room_id: &str,
    date_key: &str,
) -> Result<BackupVersion> {
    validate_date_key(date_key)?;
    let bytes = store
        .get(&keys::backup(room_id, date_key))
        .await
        .map_err(RoomError::Storage)?
        .ok_or_else(|| RoomError::VersionNotFound(date_key.to_string()))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| RoomError::Storage(format!("backup {} is unreadable: {}", date_key, e)))
}

/// Copy a backup's assets back into the room's upload prefix.
pub async fn restore_assets(
    store: &dyn BlobStore,
    room_id: &str,
    version: &BackupVersion,
) -> Result<usize> {
    let mut restored = 0;
    for (name, asset) in &version.assets {
        let bytes = match BASE64.decode(&asset.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(room_id = %room_id, asset = %name, error = %e, "Skipping undecodable backup asset");
                continue;
            }
        };
        store
            .put(&keys::upload(room_id, name), &bytes, &asset.mime_type)
            .await
            .map_err(RoomError::Storage)?;
        restored += 1;
    }
    Ok(restored)
}
