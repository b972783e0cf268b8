use crate::auth::RequireAccess;
use crate::handlers::AppState;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use whiteboard_sync::storage::OCTET_STREAM_MIME;
use whiteboard_sync::{
    BackupOutcome, RestoreSummary, RoomError, RoomHandle, Snapshot, extract_partial, keys,
    validate_room_id,
};

const MAX_ASSET_NAME_LEN: usize = 256;

/// Errors returned by HTTP handlers as `{ "error": <code>, "message": <text> }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("missing or invalid access token")]
    Unauthorized,

    #[error("invalid asset name: {0}")]
    InvalidAssetName(String),

    #[error("asset not found: {0}")]
    AssetNotFound(String),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Room(RoomError::NotInitialized) => StatusCode::CONFLICT,
            ApiError::Room(RoomError::VersionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Room(RoomError::Storage(_) | RoomError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Room(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidAssetName(_) => StatusCode::BAD_REQUEST,
            ApiError::AssetNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Room(e) => e.code(),
            ApiError::Unauthorized => "unauthorized",
            ApiError::InvalidAssetName(_) => "invalid_asset_name",
            ApiError::AssetNotFound(_) => "asset_not_found",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.code(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub date_key: String,
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub key: String,
    pub bytes: usize,
}

/// Create API routes, nested under `/api`
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(state)
}

/// Room document, backup and asset routes
pub fn room_routes(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_payload_bytes);
    Router::new()
        .route("/room/{room_id}", get(get_room).post(merge_room))
        .route("/room/{room_id}/versions", get(list_versions))
        .route("/room/{room_id}/backup", post(create_backup))
        .route("/room/{room_id}/restore", post(restore_version))
        .route(
            "/room/{room_id}/assets/{name}",
            get(download_asset).put(upload_asset),
        )
        .layer(body_limit)
        .with_state(state)
}

/// GET /api/status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
    })
}

/// Run `op` against the room's actor. An actor that stopped under the
/// request is respawned and `op` runs once more; a room that was never set up
/// is evicted again.
async fn room<T, F, Fut>(state: &AppState, room_id: &str, op: F) -> ApiResult<T>
where
    F: Fn(RoomHandle) -> Fut,
    Fut: Future<Output = Result<T, RoomError>>,
{
    let handle = state.registry.get_or_spawn(room_id).await?;
    let result = match op(handle).await {
        Err(RoomError::Closed) => {
            debug!(room_id = %room_id, "Room actor stopped during request, retrying");
            let handle = state.registry.get_or_spawn(room_id).await?;
            op(handle).await
        }
        result => result,
    };
    match result {
        Err(RoomError::NotInitialized) => {
            state.registry.maybe_remove_room(room_id).await;
            Err(RoomError::NotInitialized.into())
        }
        result => Ok(result?),
    }
}

/// GET /room/{room_id} - Canonical document
async fn get_room(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
) -> ApiResult<Json<Snapshot>> {
    let snapshot = room(&state, &room_id, |handle| async move { handle.document().await }).await?;
    Ok(Json(snapshot))
}

/// POST /room/{room_id} - Merge a partial document
async fn merge_room(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<MergeResponse>> {
    validate_room_id(&room_id)?;
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(RoomError::from)?;
    let (partial, stats) = extract_partial(payload)?;

    let records = &partial;
    let outcome = room(&state, &room_id, |handle| async move {
        handle.merge(records.clone()).await
    })
    .await?;

    if stats.skipped > 0 || stats.errored > 0 {
        warn!(
            room_id = %room_id,
            skipped = stats.skipped,
            errored = stats.errored,
            "Dropped malformed records from HTTP merge"
        );
    }
    Ok(Json(MergeResponse {
        inserted: outcome.inserted,
        updated: outcome.updated,
        unchanged: outcome.unchanged,
        skipped: stats.skipped + stats.errored,
    }))
}

/// GET /room/{room_id}/versions - Backup date keys, oldest first
async fn list_versions(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
) -> ApiResult<Json<VersionsResponse>> {
    let versions = room(&state, &room_id, |handle| async move {
        handle.list_versions().await
    })
    .await?;
    Ok(Json(VersionsResponse { versions }))
}

/// POST /room/{room_id}/backup - Today's backup, if not taken yet
async fn create_backup(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = room(&state, &room_id, |handle| async move {
        handle.create_backup().await
    })
    .await?;
    let status = match outcome {
        BackupOutcome::Created { .. } => StatusCode::CREATED,
        BackupOutcome::AlreadyExists { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// POST /room/{room_id}/restore - Replace the document with a backup
async fn restore_version(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path(room_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<RestoreSummary>> {
    let request: RestoreRequest = serde_json::from_slice(&body).map_err(RoomError::from)?;
    let date_key = request.date_key.as_str();
    let summary = room(&state, &room_id, |handle| async move {
        handle.restore(date_key).await
    })
    .await?;
    Ok(Json(summary))
}

fn validate_asset_name(name: &str) -> ApiResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_ASSET_NAME_LEN
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(ApiError::InvalidAssetName(name.to_string()))
    }
}

/// PUT /room/{room_id}/assets/{name} - Store a binary asset
async fn upload_asset(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path((room_id, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    validate_room_id(&room_id)?;
    validate_asset_name(&name)?;
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(OCTET_STREAM_MIME);

    let key = keys::upload(&room_id, &name);
    state
        .registry
        .store()
        .put(&key, &body, mime_type)
        .await
        .map_err(RoomError::Storage)?;

    info!(room_id = %room_id, key = %key, bytes = body.len(), "Stored asset");
    Ok((
        StatusCode::CREATED,
        Json(AssetResponse {
            key,
            bytes: body.len(),
        }),
    ))
}

/// GET /room/{room_id}/assets/{name} - Read a binary asset
async fn download_asset(
    State(state): State<AppState>,
    _access: RequireAccess,
    Path((room_id, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    validate_room_id(&room_id)?;
    validate_asset_name(&name)?;

    let key = keys::upload(&room_id, &name);
    let Some(object) = state
        .registry
        .store()
        .get_object(&key)
        .await
        .map_err(RoomError::Storage)?
    else {
        warn!(room_id = %room_id, key = %key, "Asset not found");
        return Err(ApiError::AssetNotFound(name));
    };

    Ok(([(header::CONTENT_TYPE, object.mime_type)], object.bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ApiError::from(RoomError::NotInitialized), StatusCode::CONFLICT),
            (
                ApiError::from(RoomError::InvalidRoomId("a/b".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(RoomError::InvalidDateKey("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(RoomError::VersionNotFound("2024-01-01".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(RoomError::Storage("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (ApiError::from(RoomError::Closed), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
        ];
        for (error, status) in cases {
            assert_eq!(error.status(), status, "{}", error);
        }
    }

    #[tokio::test]
    async fn test_request_survives_actor_turnover() {
        use crate::config::Config;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use whiteboard_sync::{InMemoryBlobStore, Record, RecordMap, RoomRegistry, TypeName};

        let config = Config::default();
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(InMemoryBlobStore::new()),
            config.room_settings(),
        ));
        let state = AppState::new(registry.clone(), &config);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle, connection) = registry.connect("room-1", "s1", None, tx).await.unwrap();
        handle.disconnect("s1", connection).await.unwrap();

        let record = Record::new("shape:a", TypeName::Shape);
        let partial: RecordMap = [(record.id.clone(), record)].into_iter().collect();
        let attempts = AtomicUsize::new(0);

        // The first attempt sees its actor evicted before the merge lands.
        let outcome = room(&state, "room-1", |handle| {
            let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
            let partial = partial.clone();
            async move {
                if first {
                    assert!(handle.shutdown_if_idle().await?);
                }
                handle.merge(partial).await
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.inserted, 1);
        let handle = registry.get("room-1").await.unwrap();
        assert!(handle.document().await.unwrap().get("shape:a").is_some());
    }

    #[test]
    fn test_asset_names() {
        assert!(validate_asset_name("image-1.png").is_ok());
        assert!(validate_asset_name("").is_err());
        assert!(validate_asset_name("..").is_err());
        assert!(validate_asset_name("a/b.png").is_err());
        assert!(validate_asset_name(&"x".repeat(257)).is_err());
    }
}
