//! Sync protocol frames.
//!
//! JSON frames are tagged by `type`:
//!
//! - `{"type":"sync","senderId":..,"targetId":..,"documentId":..,"data":..}`
//!   carries a partial document. `data` may be a `{records}` snapshot, a bare
//!   record map, or a list of wrapped records.
//! - `{"type":"ping"}` / `{"type":"pong"}` keep-alives.
//! - `{"type":"request"}` asks the server to resend the full document.
//!
//! Sync frames are relayed re-encoded: peers see only the records the server
//! accepted, stamped with the sender's real session id and the room id.
//! Binary frames are opaque and relayed to the other connections verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connections::OutboundFrame;
use crate::error::{Result, RoomError};
use crate::migrate;
use crate::record::{RecordMap, Snapshot};

/// `senderId` of frames produced by the room itself.
pub const SERVER_SENDER_ID: &str = "server";
/// `senderId` of frames relaying an HTTP merge.
pub const HTTP_SENDER_ID: &str = "http";

// ==================== Frame Types ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Sync(SyncFrame),
    Ping,
    Pong,
    Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Deliver only to this session when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    /// Full-document frame sent on connect and in reply to `request`.
    pub fn snapshot(room_id: &str, target_id: &str, snapshot: &Snapshot) -> Result<Self> {
        Ok(Frame::Sync(SyncFrame {
            sender_id: Some(SERVER_SENDER_ID.to_string()),
            target_id: Some(target_id.to_string()),
            document_id: Some(room_id.to_string()),
            data: serde_json::to_value(snapshot)?,
        }))
    }

    /// Frame relaying records `sender_id` merged into the room.
    pub fn relay(
        room_id: &str,
        sender_id: &str,
        target_id: Option<String>,
        records: &RecordMap,
    ) -> Result<Self> {
        Ok(Frame::Sync(SyncFrame {
            sender_id: Some(sender_id.to_string()),
            target_id,
            document_id: Some(room_id.to_string()),
            data: serde_json::json!({ "records": records }),
        }))
    }

    /// Frame relaying records merged through the HTTP surface.
    pub fn http_merge(room_id: &str, records: &RecordMap) -> Result<Self> {
        Self::relay(room_id, HTTP_SENDER_ID, None, records)
    }

    pub fn encode(&self) -> Result<OutboundFrame> {
        Ok(OutboundFrame::Text(serde_json::to_string(self)?))
    }
}

// ==================== Inbound Handling ====================

/// A message received from a client's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// What the room should do with an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundAction {
    /// Merge `partial`, then deliver `relay` to `target_id` or to everyone
    /// but the sender.
    Sync {
        partial: RecordMap,
        target_id: Option<String>,
        relay: OutboundFrame,
    },
    /// Relay to everyone but the sender without interpreting it.
    Relay(OutboundFrame),
    /// Answer with a `pong`.
    Pong,
    /// Resend the full document to the sender.
    SendSnapshot,
    Ignore,
}

/// Decode a message `session_id` sent to room `room_id`. Errors mean the
/// frame should be dropped.
pub fn interpret(room_id: &str, session_id: &str, message: InboundMessage) -> Result<InboundAction> {
    let text = match message {
        InboundMessage::Binary(bytes) => {
            return Ok(InboundAction::Relay(OutboundFrame::Binary(bytes)));
        }
        InboundMessage::Text(text) => text,
    };

    let frame: Frame = serde_json::from_str(&text)
        .map_err(|e| RoomError::InvalidPayload(format!("undecodable frame: {}", e)))?;

    match frame {
        Frame::Sync(sync) => {
            let (partial, stats) = migrate::extract_partial(sync.data)?;
            if stats.skipped > 0 || stats.errored > 0 {
                tracing::warn!(
                    skipped = stats.skipped,
                    errored = stats.errored,
                    "Dropped malformed records from sync frame"
                );
            }
            let relay = Frame::relay(room_id, session_id, sync.target_id.clone(), &partial)?.encode()?;
            Ok(InboundAction::Sync {
                partial,
                target_id: sync.target_id,
                relay,
            })
        }
        Frame::Ping => Ok(InboundAction::Pong),
        Frame::Request => Ok(InboundAction::SendSnapshot),
        Frame::Pong => Ok(InboundAction::Ignore),
    }
}

// ==================== Tests ====================
