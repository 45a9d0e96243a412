//! Configuration for the realtime subsystem.
//!
//! One flat structure carries every tunable the components recognize. The
//! binary embeds this in its TOML application config; tests construct it
//! directly with the values they need.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for connection tracking, delivery, throttling and cleanup.
///
/// All intervals and ages are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// How often the health monitor sweeps active connections.
    pub health_check_interval: u64,

    /// A connection with no inbound activity for this long is stale.
    pub connection_timeout: u64,

    /// How long a token validation result is trusted before the auth
    /// collaborator is consulted again.
    pub token_revalidation_interval: u64,

    /// Connection attempts allowed per player within `connection_window`.
    pub max_connection_attempts: u32,

    /// Sliding window for connection-attempt throttling.
    pub connection_window: u64,

    /// Messages allowed per connection within `message_window`.
    pub max_messages_per_minute: u32,

    /// Sliding window for per-connection message throttling.
    pub message_window: u64,

    /// Per-player pending-message cap enforced on every enqueue; the oldest
    /// message is dropped once exceeded.
    pub max_messages_per_player: usize,

    /// How often the cleanup loop considers running, and the stale-player
    /// pruning threshold.
    pub cleanup_interval: u64,

    /// Process memory fraction (0.0–1.0) above which cleanup runs regardless
    /// of the interval.
    pub memory_threshold: f64,

    /// Connections older than this are closed by the cleaner even if active.
    pub max_connection_age: u64,

    /// Hard trim applied to every pending-message queue during cleanup.
    pub max_pending_messages: usize,

    /// Hard trim applied to every rate-limit window during cleanup.
    pub max_rate_limit_entries: usize,

    /// Reconnect attempts before a bus connection opens its circuit.
    pub max_reconnect_attempts: u32,

    /// Largest serialized event payload delivered as-is; anything bigger is
    /// replaced with an error envelope.
    pub max_payload_bytes: usize,
}

impl RealtimeConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn connection_window(&self) -> Duration {
        Duration::from_secs(self.connection_window)
    }

    pub fn message_window(&self) -> Duration {
        Duration::from_secs(self.message_window)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

impl Default for RealtimeConfig {
    /// Production defaults sized for a few thousand concurrent players.
    fn default() -> Self {
        Self {
            health_check_interval: 30,
            connection_timeout: 90,
            token_revalidation_interval: 300,
            max_connection_attempts: 5,
            connection_window: 60,
            max_messages_per_minute: 100,
            message_window: 60,
            max_messages_per_player: 50,
            cleanup_interval: 300,
            memory_threshold: 0.85,
            max_connection_age: 21_600,
            max_pending_messages: 100,
            max_rate_limit_entries: 1_000,
            max_reconnect_attempts: 5,
            max_payload_bytes: 64 * 1024,
        }
    }
}
