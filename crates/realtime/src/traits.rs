//! Collaborator interfaces consumed by the realtime subsystem.
//!
//! The subsystem never talks to a socket, an auth backend or the world store
//! directly; it goes through these narrow capabilities, injected at
//! construction time by the composition root.

use crate::error::{DirectoryError, TransportError};
use crate::types::{ConnectionId, PlayerId, RoomId};
use async_trait::async_trait;

/// Outbound transport for established client connections.
///
/// Implementations own the actual sockets, keyed by connection id. Liveness
/// is a first-class query (`is_open`) rather than something inferred from
/// send failures; errors from `send` mean a genuine I/O fault.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one JSON payload to a connection.
    async fn send(
        &self,
        connection_id: ConnectionId,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Whether the connection is still open at the transport layer.
    async fn is_open(&self, connection_id: ConnectionId) -> bool;

    /// Closes the connection with a close code and reason.
    async fn close(&self, connection_id: ConnectionId, code: u16, reason: &str);
}

/// Token validation against the auth collaborator.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Returns true if the token is still valid for the player.
    async fn validate_token(&self, token: &str, player_id: PlayerId) -> bool;
}

/// Read-only view of the persisted world, used for room-id canonicalization
/// and periodic sweeps.
#[async_trait]
pub trait WorldDirectory: Send + Sync {
    /// Resolves any room alias to its canonical id.
    async fn resolve_canonical_room_id(&self, room_id: &RoomId) -> Result<RoomId, DirectoryError>;

    /// Lists every room known to the world store.
    async fn list_rooms(&self) -> Result<Vec<RoomId>, DirectoryError>;

    /// Players the world store believes are in the room.
    async fn room_players(&self, room_id: &RoomId) -> Result<Vec<PlayerId>, DirectoryError>;
}

/// Teardown capability for connections discovered dead mid-operation.
///
/// The sender, broadcaster and health monitor all hold one of these instead
/// of reaching back into the registry, so a failed send anywhere funnels
/// through the same removal path.
#[async_trait]
pub trait DeadConnectionSink: Send + Sync {
    /// Removes a dead connection and its per-connection bookkeeping.
    async fn cleanup_dead_connection(&self, player_id: PlayerId, connection_id: ConnectionId);
}
