//! HTTP and WebSocket front end for whiteboard rooms.
//!
//! Wires [`whiteboard_sync`] rooms to axum: `/connect/{roomId}` upgrades to a
//! room's sync channel, `/room/{roomId}` reads and merges documents, and the
//! backup, restore and asset routes sit next to it.

pub mod auth;
pub mod blob_store;
pub mod config;
pub mod handlers;

pub use handlers::{AppState, router};
