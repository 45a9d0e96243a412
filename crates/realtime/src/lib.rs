//! # Realtime - Presence & Message Delivery
//!
//! The realtime layer of the Thornmoor text-game server: it tracks which
//! players hold live transport connections, delivers events to individual
//! players and to room/global audiences, guarantees eventual delivery to
//! temporarily-offline players, throttles abusive traffic, and continuously
//! repairs inconsistent connection/presence state.
//!
//! ## Components
//!
//! * **Connection Registry** - owns the shared connection/presence/session
//!   maps and wires everything together
//! * **Rate Limiter** - sliding-window throttling for connection attempts and
//!   per-connection messages
//! * **Message Queue** - bounded, TTL'd per-player storage for offline
//!   delivery
//! * **Room Manager** - per-room subscriber and occupant sets with canonical
//!   id resolution
//! * **Sender & Broadcaster** - single-target delivery and concurrent fan-out
//! * **Health Monitor** - periodic staleness/liveness/token-revalidation
//!   sweeps
//! * **Memory Monitor & Cleaner** - time/memory-triggered pruning of stale
//!   players, orphaned data and ghost occupants
//! * **Bus State Machine** - lifecycle bookkeeping for logical message-bus
//!   connections
//!
//! ## Collaborators
//!
//! The subsystem performs no I/O of its own. The transport, token validation
//! and world-directory capabilities are traits ([`Transport`],
//! [`TokenValidator`], [`WorldDirectory`]) injected into
//! [`ConnectionRegistry::new`] by the composition root.
//!
//! ## Concurrency Model
//!
//! Shared maps each sit behind their own short-held `RwLock`; no operation
//! holds two at once. Background loops (health, cleanup) are independent
//! tasks cancelled through a broadcast shutdown channel. Broadcast fan-out
//! launches all per-target sends together and awaits them together.

pub use broadcast::{BroadcastOutcome, MessageBroadcaster};
pub use cleaner::{CleanupReport, ConnectionCleaner};
pub use config::RealtimeConfig;
pub use connection::{Connection, ConnectionHealthStats, ConnectionTable, PlayerPresence};
pub use error::{DirectoryError, IllegalTransition, RealtimeError, TransportError};
pub use health::HealthMonitor;
pub use memory::{MemoryMonitor, MemoryStats};
pub use message_queue::{MessageQueue, MessageQueueStats};
pub use rate_limit::{RateLimitInfo, RateLimiterStats, SlidingWindowLimiter};
pub use registry::{ConnectionReaper, ConnectionRegistry};
pub use rooms::{RoomManager, RoomStats};
pub use sender::{DeliveryStatus, PersonalMessageSender};
pub use state_machine::{BusConnectionStateMachine, BusConnectionStats, BusEvent, BusState};
pub use stats::{RealtimeStats, StatisticsAggregator};
pub use traits::{DeadConnectionSink, TokenValidator, Transport, WorldDirectory};
pub use types::{
    current_timestamp, current_timestamp_millis, ConnectionId, PlayerId, RoomId, SessionId,
};

pub mod broadcast;
pub mod cleaner;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod memory;
pub mod message_queue;
pub mod rate_limit;
pub mod registry;
pub mod rooms;
pub mod sender;
pub mod state_machine;
pub mod stats;
pub mod traits;
pub mod types;
