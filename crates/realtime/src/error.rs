//! Error types for the realtime subsystem.

use crate::state_machine::{BusEvent, BusState};
use crate::types::{ConnectionId, PlayerId};

/// Errors surfaced by registry and delivery operations.
///
/// Delivery paths report partial failure through structured statuses rather
/// than through this enum; these variants cover the cases where an operation
/// cannot proceed at all.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// A sliding-window limit rejected the triggering action.
    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),
    /// The connection id is not present in the registry.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    /// The player has no presence record.
    #[error("Unknown player: {0}")]
    UnknownPlayer(PlayerId),
    /// Event payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A transport operation failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures reported by the transport collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is no longer open at the transport layer.
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
    /// The underlying socket write failed.
    #[error("Send failed on {connection_id}: {reason}")]
    SendFailed {
        connection_id: ConnectionId,
        reason: String,
    },
}

/// Failures reported by the world directory collaborator.
///
/// These are always non-fatal to the caller; lookups degrade to the raw id
/// and sweeps skip the cycle.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Room lookup failed: {0}")]
    Lookup(String),
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// A state-machine transition that is not declared in the transition table.
///
/// This is a programming error on the caller's side and is never silently
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition: {event:?} while {from:?}")]
pub struct IllegalTransition {
    /// The state the machine was in when the event arrived.
    pub from: BusState,
    /// The event that had no declared transition from that state.
    pub event: BusEvent,
}
