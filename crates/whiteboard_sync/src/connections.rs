//! Active connections of one room.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A frame queued for delivery to one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Sending half of a client's outbound queue. The transport task owns the
/// receiving half and drains it into the socket.
pub type ConnectionSink = mpsc::UnboundedSender<OutboundFrame>;

/// Identifies one registration of a session. A reconnect under the same
/// session id gets a new id, so the old transport cannot remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Per-room map of session id to connection.
///
/// Sends never fail: a connection whose transport already went away is
/// skipped, and stays registered until its explicit disconnect arrives.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, Connection>,
    next_id: u64,
}

#[derive(Debug)]
struct Connection {
    id: ConnectionId,
    sink: ConnectionSink,
    identity: Option<String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A reconnect with the same session id replaces
    /// the previous handle.
    pub fn register(
        &mut self,
        session_id: &str,
        sink: ConnectionSink,
        identity: Option<String>,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        if self
            .connections
            .insert(session_id.to_string(), Connection { id, sink, identity })
            .is_some()
        {
            debug!(session_id = %session_id, "Replaced existing connection");
        }
        id
    }

    /// Remove the session if it is still the registration `id`.
    pub fn unregister(&mut self, session_id: &str, id: ConnectionId) -> bool {
        match self.connections.get(session_id) {
            Some(connection) if connection.id == id => {
                self.connections.remove(session_id);
                true
            }
            Some(_) => {
                debug!(session_id = %session_id, "Ignoring disconnect of a replaced connection");
                false
            }
            None => false,
        }
    }

    /// Deliver to one session. Returns whether the frame was queued.
    pub fn send_to(&self, session_id: &str, frame: OutboundFrame) -> bool {
        match self.connections.get(session_id) {
            Some(connection) => connection.sink.send(frame).is_ok(),
            None => false,
        }
    }

    /// Deliver to every session except `sender_id`. Returns how many
    /// connections accepted the frame.
    pub fn broadcast_except(&self, sender_id: &str, frame: &OutboundFrame) -> usize {
        self.connections
            .iter()
            .filter(|(session_id, _)| session_id.as_str() != sender_id)
            .filter(|(_, connection)| connection.sink.send(frame.clone()).is_ok())
            .count()
    }

    pub fn identity(&self, session_id: &str) -> Option<&str> {
        self.connections
            .get(session_id)
            .and_then(|connection| connection.identity.as_deref())
    }

    pub fn session_ids(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
