//! Lifecycle state machine for a logical message-bus connection.
//!
//! Pure bookkeeping: the machine records where a bus connection is in its
//! connect/reconnect/circuit-breaker lifecycle and refuses undeclared
//! transitions. It performs no I/O; the owner drives it from transport
//! events.

use crate::error::IllegalTransition;
use crate::types::current_timestamp;
use serde::{Deserialize, Serialize};

/// Lifecycle states of a bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    CircuitOpen,
    Degraded,
}

/// Events that drive transitions between [`BusState`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusEvent {
    Connect,
    ConnectedSuccessfully,
    ConnectionFailed,
    Disconnect,
    StartReconnect,
    Degrade,
    Recover,
    OpenCircuit,
    CloseCircuit,
}

/// Serializable snapshot of a machine's counters and state.
#[derive(Debug, Clone, Serialize)]
pub struct BusConnectionStats {
    pub id: String,
    pub state: BusState,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub last_connected_at: Option<u64>,
    pub last_error: Option<String>,
}

/// State machine instance for one logical bus connection.
///
/// Every mutation goes through the `(state, event)` transition table; an
/// undeclared pair is a hard [`IllegalTransition`] error, never a silent
/// no-op.
#[derive(Debug, Clone)]
pub struct BusConnectionStateMachine {
    id: String,
    state: BusState,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    last_error: Option<String>,
    total_connections: u64,
    total_disconnections: u64,
    last_connected_at: Option<u64>,
}

impl BusConnectionStateMachine {
    /// Creates a machine in the initial `Disconnected` state.
    pub fn new(id: impl Into<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            id: id.into(),
            state: BusState::Disconnected,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            last_error: None,
            total_connections: 0,
            total_disconnections: 0,
            last_connected_at: None,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The `(state, event) -> state` transition table.
    ///
    /// Counter and timestamp side effects live here with the transition that
    /// causes them.
    fn apply(&mut self, event: BusEvent) -> Result<BusState, IllegalTransition> {
        use BusEvent::*;
        use BusState::*;

        let next = match (self.state, event) {
            (Disconnected, Connect) => Connecting,
            (Connecting | Reconnecting, ConnectedSuccessfully) => {
                self.reconnect_attempts = 0;
                self.last_connected_at = Some(current_timestamp());
                self.total_connections += 1;
                Connected
            }
            (Connecting | Reconnecting, ConnectionFailed) => {
                self.reconnect_attempts += 1;
                Disconnected
            }
            (Connected | Degraded, Disconnect) => {
                self.total_disconnections += 1;
                Disconnected
            }
            (Disconnected, StartReconnect) => Reconnecting,
            (Connected, Degrade) => Degraded,
            (Degraded, Recover) => Connected,
            (Reconnecting, OpenCircuit) => CircuitOpen,
            (CircuitOpen, CloseCircuit) => {
                self.reconnect_attempts = 0;
                self.last_error = None;
                Disconnected
            }
            (from, event) => return Err(IllegalTransition { from, event }),
        };
        self.state = next;
        Ok(next)
    }

    /// Begins a fresh connection attempt.
    pub fn connect(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::Connect)
    }

    /// Records a successful connection, resetting the attempt counter.
    pub fn connected_successfully(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::ConnectedSuccessfully)
    }

    /// Records a failed attempt with its error.
    pub fn connection_failed(
        &mut self,
        error: impl Into<String>,
    ) -> Result<BusState, IllegalTransition> {
        let next = self.apply(BusEvent::ConnectionFailed)?;
        self.last_error = Some(error.into());
        Ok(next)
    }

    /// Records a clean disconnect.
    pub fn disconnect(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::Disconnect)
    }

    /// Enters the reconnect phase.
    pub fn start_reconnect(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::StartReconnect)
    }

    /// Marks a live connection as degraded.
    pub fn degrade(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::Degrade)
    }

    /// Restores a degraded connection to healthy.
    pub fn recover(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::Recover)
    }

    /// Stops attempting reconnects after repeated failures.
    pub fn open_circuit(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::OpenCircuit)
    }

    /// Closes the circuit, clearing the attempt counter and last error.
    pub fn close_circuit(&mut self) -> Result<BusState, IllegalTransition> {
        self.apply(BusEvent::CloseCircuit)
    }

    /// Whether a connection attempt may be made in the current state.
    pub fn can_attempt_connection(&self) -> bool {
        matches!(
            self.state,
            BusState::Disconnected | BusState::Connecting | BusState::Reconnecting
        )
    }

    /// Whether the failure count has reached the circuit-breaker threshold.
    pub fn should_open_circuit(&self) -> bool {
        self.reconnect_attempts >= self.max_reconnect_attempts
    }

    /// Administrative reset back to the initial state, clearing counters.
    pub fn reset(&mut self) {
        self.state = BusState::Disconnected;
        self.reconnect_attempts = 0;
        self.last_error = None;
    }

    /// Snapshot for the statistics report.
    pub fn stats(&self) -> BusConnectionStats {
        BusConnectionStats {
            id: self.id.clone(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.max_reconnect_attempts,
            total_connections: self.total_connections,
            total_disconnections: self.total_disconnections,
            last_connected_at: self.last_connected_at,
            last_error: self.last_error.clone(),
        }
    }
}
