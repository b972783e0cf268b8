use thiserror::Error;

/// Errors surfaced by room operations.
#[derive(Debug, Error)]
pub enum RoomError {
    /// A non-connect request reached a room whose id was never recorded.
    #[error("room not initialized")]
    NotInitialized,

    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("invalid date key: {0}")]
    InvalidDateKey(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The room actor has stopped; the caller may retry against a new one.
    #[error("room actor closed")]
    Closed,
}

impl RoomError {
    /// Short machine-readable code, used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::NotInitialized => "room_not_initialized",
            RoomError::InvalidRoomId(_) => "invalid_room_id",
            RoomError::VersionNotFound(_) => "version_not_found",
            RoomError::InvalidDateKey(_) => "invalid_date_key",
            RoomError::InvalidPayload(_) => "invalid_payload",
            RoomError::Storage(_) => "storage_unavailable",
            RoomError::Closed => "room_closed",
        }
    }

    /// Whether the caller sent something wrong, as opposed to the server
    /// failing to serve a valid request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RoomError::NotInitialized
                | RoomError::InvalidRoomId(_)
                | RoomError::VersionNotFound(_)
                | RoomError::InvalidDateKey(_)
                | RoomError::InvalidPayload(_)
        )
    }
}

impl From<serde_json::Error> for RoomError {
    fn from(error: serde_json::Error) -> Self {
        RoomError::InvalidPayload(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
